/// Cast an expression to a usize using TryInto.
#[macro_export]
macro_rules! cast_usize {
    ($e:expr) => {{
        let Ok(u) = <_ as TryInto<usize>>::try_into($e) else {
            unreachable!("unsupported target architecture")
        };
        u
    }};
}
pub use cast_usize;

/// Cast a usize (or any integer) to a tick count, saturating at [crate::time::TIME_MAX].
#[macro_export]
macro_rules! cast_ticks {
    ($e:expr) => {{
        match <_ as TryInto<i64>>::try_into($e) {
            Ok(t) => t.min($crate::time::TIME_MAX),
            Err(_) => $crate::time::TIME_MAX,
        }
    }};
}
pub use cast_ticks;
