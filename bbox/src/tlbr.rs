use crate::{common::*, CyCxHW, HW};

/// Bounding box in corner form: top-left and bottom-right points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TLBR<T> {
    pub(crate) t: T,
    pub(crate) l: T,
    pub(crate) b: T,
    pub(crate) r: T,
}

impl<T> TLBR<T> {
    pub fn try_cast<V>(self) -> Option<TLBR<V>>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        Some(TLBR {
            t: V::from(self.t)?,
            l: V::from(self.l)?,
            b: V::from(self.b)?,
            r: V::from(self.r)?,
        })
    }

    pub fn cast<V>(self) -> TLBR<V>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        self.try_cast().unwrap()
    }
}

impl<T> TLBR<T>
where
    T: Copy + Num + PartialOrd,
{
    pub fn try_from_tlbr(tlbr: [T; 4]) -> Result<Self> {
        let [t, l, b, r] = tlbr;
        ensure!(b >= t && r >= l, "b >= t and r >= l must hold");
        Ok(Self { t, l, b, r })
    }

    pub fn from_tlbr(tlbr: [T; 4]) -> Self {
        Self::try_from_tlbr(tlbr).unwrap()
    }

    pub fn t(&self) -> T {
        self.t
    }

    pub fn l(&self) -> T {
        self.l
    }

    pub fn b(&self) -> T {
        self.b
    }

    pub fn r(&self) -> T {
        self.r
    }

    pub fn h(&self) -> T {
        self.b - self.t
    }

    pub fn w(&self) -> T {
        self.r - self.l
    }

    pub fn tlbr_params(&self) -> [T; 4] {
        [self.t, self.l, self.b, self.r]
    }

    /// Clamp the corners into the `[0, h] x [0, w]` region of an image.
    ///
    /// The corners are clipped independently. A box lying entirely outside
    /// the region degenerates to a zero-area box on the border.
    pub fn clip_to(&self, bounds: &HW<T>) -> Self {
        let zero = T::zero();
        let clamp = |value: T, min: T, max: T| {
            if value < min {
                min
            } else if value > max {
                max
            } else {
                value
            }
        };

        Self {
            t: clamp(self.t, zero, bounds.h()),
            l: clamp(self.l, zero, bounds.w()),
            b: clamp(self.b, zero, bounds.h()),
            r: clamp(self.r, zero, bounds.w()),
        }
    }
}

impl<T> From<CyCxHW<T>> for TLBR<T>
where
    T: Copy + Num,
{
    fn from(from: CyCxHW<T>) -> Self {
        Self::from(&from)
    }
}

impl<T> From<&CyCxHW<T>> for TLBR<T>
where
    T: Copy + Num,
{
    fn from(from: &CyCxHW<T>) -> Self {
        let two = T::one() + T::one();
        let CyCxHW { cy, cx, h, w } = *from;
        let t = cy - h / two;
        let l = cx - w / two;
        let b = cy + h / two;
        let r = cx + w / two;
        Self { t, l, b, r }
    }
}
