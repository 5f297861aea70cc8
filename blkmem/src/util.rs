use std::{fmt, ptr::NonNull};

/// Round `num` up to a multiple of `align` (which need not be a power of two)
pub const fn roundto(num: usize, align: usize) -> usize {
    divroundup(num, align) * align
}

/// Divide, rounding up
pub const fn divroundup(num: usize, divisor: usize) -> usize {
    (num + divisor - 1) / divisor
}

/// Wrapper that formats an address as hex in `Debug` output
///
/// Used for `tracing` fields and diagnostics, where printing the
/// pointer type itself would be noisy.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UsizePtr(pub usize);

impl fmt::Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Display for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl<T: ?Sized> From<*const T> for UsizePtr {
    fn from(value: *const T) -> Self {
        Self(value as *const () as usize)
    }
}

impl<T: ?Sized> From<*mut T> for UsizePtr {
    fn from(value: *mut T) -> Self {
        Self(value as *const () as usize)
    }
}

impl<T: ?Sized> From<NonNull<T>> for UsizePtr {
    fn from(value: NonNull<T>) -> Self {
        Self(value.as_ptr() as *const () as usize)
    }
}

impl<T: ?Sized> From<&T> for UsizePtr {
    fn from(value: &T) -> Self {
        Self(value as *const T as *const () as usize)
    }
}

/// Calculate the capacity to use for a dynamically grown array
///
/// With `growfac == 1.0` this is just `max(initsize, num)`. Otherwise the
/// sequence `s = max(initsize, 4)`, `s = growfac * s + initsize` is followed
/// until it reaches `num`, so the result is the same for every caller asking
/// for the same `num`. If the sequence stops making progress (overflow) the
/// result is `num`. The result never exceeds `max(num, limit)`.
pub fn calc_grow_size(initsize: usize, growfac: f64, num: usize, limit: usize) -> usize {
    debug_assert!(growfac >= 1.0);

    let size = if growfac == 1.0 {
        initsize.max(num)
    } else {
        let initsize = initsize.max(4);
        let mut size = initsize;
        let mut oldsize = size - 1;

        // second condition catches overflow (and float saturation)
        while size < num && size > oldsize {
            oldsize = size;
            size = (growfac * size as f64) as usize;
            size = size.saturating_add(initsize);
        }

        if size <= oldsize {
            num
        } else {
            size
        }
    };

    if size > limit {
        num.max(limit)
    } else {
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divroundup_test() {
        assert_eq!(divroundup(0, 4), 0);
        assert_eq!(divroundup(4, 4), 1);
        assert_eq!(divroundup(5, 4), 2);
    }

    #[test]
    fn roundto_test() {
        assert_eq!(roundto(0, 8), 0);
        assert_eq!(roundto(1, 8), 8);
        assert_eq!(roundto(8, 8), 8);
        assert_eq!(roundto(9, 8), 16);
        assert_eq!(roundto(10, 3), 12);
    }

    #[test]
    fn usize_ptr_fmt() {
        let p = UsizePtr(0x2abc);
        assert_eq!(format!("{:?}", p), "0x2abc");
        assert_eq!(format!("{}", p), "0x2abc");

        let x = 5u32;
        assert_eq!(UsizePtr::from(&x).0, &x as *const u32 as usize);
    }

    #[test]
    fn grow_size_factor_one() {
        assert_eq!(calc_grow_size(4, 1.0, 1, usize::MAX), 4);
        assert_eq!(calc_grow_size(4, 1.0, 17, usize::MAX), 17);
    }

    #[test]
    fn grow_size_sequence() {
        // init 4, fac 2: 4 -> 12 -> 28 -> 60
        assert_eq!(calc_grow_size(4, 2.0, 1, usize::MAX), 4);
        assert_eq!(calc_grow_size(4, 2.0, 5, usize::MAX), 12);
        assert_eq!(calc_grow_size(4, 2.0, 13, usize::MAX), 28);
        assert_eq!(calc_grow_size(4, 2.0, 29, usize::MAX), 60);

        // init below 4 is bumped to 4, but the increment stays 4 as well
        assert_eq!(calc_grow_size(1, 2.0, 5, usize::MAX), 12);

        // fac 1.2, init 4: 4 -> 8 -> 13 -> 19
        assert_eq!(calc_grow_size(4, 1.2, 9, usize::MAX), 13);
        assert_eq!(calc_grow_size(4, 1.2, 14, usize::MAX), 19);
    }

    #[test]
    fn grow_size_limit() {
        assert_eq!(calc_grow_size(4, 2.0, 29, 40), 40);
        assert_eq!(calc_grow_size(4, 2.0, 50, 40), 50);
        assert!(calc_grow_size(4, 2.0, usize::MAX - 1, usize::MAX) >= usize::MAX - 1);
    }
}
