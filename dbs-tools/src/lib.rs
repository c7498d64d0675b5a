pub mod fd;
pub mod sync;

/// Assert the size of a type at compile time.
///
/// On-disk structures use this to pin their layout; a stray field or
/// padding change fails the build instead of silently breaking the
/// format.
#[macro_export]
macro_rules! static_assert_size {
    ($ty:ty, $size:expr) => {
        const _: fn() = || {
            let _ = ::std::mem::transmute::<$ty, [u8; $size]>;
        };
    };
}
