//! Helper macros for hook generation.
//!
//! Provides the `hook_fn!` macro that generates `#[unsafe(no_mangle)] pub extern "C" fn`
//! entrypoints. Hooks take addresses as plain integers and never dereference
//! them, so the generated functions are safe to call.

/// Generate an exported `extern "C"` hook.
///
/// # Usage
///
/// ```ignore
/// hook_fn! {
///     /// Doc comment for the hook.
///     fn __racesan_thing(pc: usize) -> c_int {
///         // body
///     }
/// }
/// ```
macro_rules! hook_fn {
    (
        $(#[$meta:meta])*
        fn $name:ident( $($arg:ident : $argty:ty),* $(,)? ) -> $ret:ty
        $body:block
    ) => {
        $(#[$meta])*
        #[unsafe(no_mangle)]
        pub extern "C" fn $name( $($arg : $argty),* ) -> $ret $body
    };

    // Variant without return type (returns ())
    (
        $(#[$meta:meta])*
        fn $name:ident( $($arg:ident : $argty:ty),* $(,)? )
        $body:block
    ) => {
        $(#[$meta])*
        #[unsafe(no_mangle)]
        pub extern "C" fn $name( $($arg : $argty),* ) $body
    };
}

pub(crate) use hook_fn;
