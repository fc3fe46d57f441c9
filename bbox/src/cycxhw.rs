use crate::{common::*, TLBR};

/// Bounding box in center form: center position plus height and width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CyCxHW<T> {
    pub(crate) cy: T,
    pub(crate) cx: T,
    pub(crate) h: T,
    pub(crate) w: T,
}

impl<T> CyCxHW<T> {
    pub fn try_cast<V>(self) -> Option<CyCxHW<V>>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        Some(CyCxHW {
            cy: V::from(self.cy)?,
            cx: V::from(self.cx)?,
            h: V::from(self.h)?,
            w: V::from(self.w)?,
        })
    }

    pub fn cast<V>(self) -> CyCxHW<V>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        self.try_cast().unwrap()
    }
}

impl<T> CyCxHW<T>
where
    T: Copy + Num + PartialOrd,
{
    pub fn try_from_cycxhw(cycxhw: [T; 4]) -> Result<Self> {
        let [cy, cx, h, w] = cycxhw;
        let zero = T::zero();
        ensure!(h >= zero && w >= zero, "h and w must be non-negative");
        Ok(Self { cy, cx, h, w })
    }

    pub fn from_cycxhw(cycxhw: [T; 4]) -> Self {
        Self::try_from_cycxhw(cycxhw).unwrap()
    }

    pub fn cy(&self) -> T {
        self.cy
    }

    pub fn cx(&self) -> T {
        self.cx
    }

    pub fn h(&self) -> T {
        self.h
    }

    pub fn w(&self) -> T {
        self.w
    }

    /// Convert to corner form.
    pub fn to_tlbr(&self) -> TLBR<T> {
        TLBR::from(self)
    }

    pub fn cycxhw_params(&self) -> [T; 4] {
        [self.cy, self.cx, self.h, self.w]
    }
}
