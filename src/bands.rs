use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Sub};

/// A set of readiness bands for a descriptor.
///
/// Three bands exist: readable, writable and error-condition. The reactor
/// core tracks three independent views of a descriptor as band sets: what the
/// application wants, what the backend has installed in the kernel, and what
/// fired during the most recent poll round.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Bands(u8);

impl Bands {
    pub const NONE: Bands = Bands(0);
    pub const IN: Bands = Bands(1);
    pub const OUT: Bands = Bands(2);
    pub const ERR: Bands = Bands(4);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Bands) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Bands) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Bands {
    type Output = Bands;

    fn bitor(self, rhs: Bands) -> Bands {
        Bands(self.0 | rhs.0)
    }
}

impl BitOrAssign for Bands {
    fn bitor_assign(&mut self, rhs: Bands) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Bands {
    type Output = Bands;

    fn bitand(self, rhs: Bands) -> Bands {
        Bands(self.0 & rhs.0)
    }
}

impl Sub for Bands {
    type Output = Bands;

    fn sub(self, rhs: Bands) -> Bands {
        Bands(self.0 & !rhs.0)
    }
}

impl fmt::Debug for Bands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "-");
        }
        let mut first = true;
        for (band, name) in [(Bands::IN, "IN"), (Bands::OUT, "OUT"), (Bands::ERR, "ERR")] {
            if self.contains(band) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}
