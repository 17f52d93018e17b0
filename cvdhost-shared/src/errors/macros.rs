//! Propagation macros.
//!
//! Every macro captures `file!()`, `line!()` and the enclosing function path,
//! so each propagation site contributes exactly one frame.

/// Path of the enclosing function, e.g. `cvdhost::relay::console::run`.
#[doc(hidden)]
#[macro_export]
macro_rules! __function_path {
    () => {{
        fn __here() {}
        fn __type_name_of<T>(_: T) -> &'static str {
            ::core::any::type_name::<T>()
        }
        let name = __type_name_of(__here);
        match name.strip_suffix("::__here") {
            ::core::option::Option::Some(stripped) => stripped,
            ::core::option::Option::None => name,
        }
    }};
}

/// A frame for the current source location.
#[macro_export]
macro_rules! stack_entry {
    () => {
        $crate::errors::StackTraceEntry::new(file!(), line!(), $crate::__function_path!())
    };
    ($origin:literal, $expr:expr) => {
        $crate::stack_entry!().with_expression($origin, $expr)
    };
}

/// Unwrap a `Result` or `Option`, or return its error with a new frame.
///
/// An optional format string and arguments become the frame message.
#[macro_export]
macro_rules! propagate {
    ($outcome:expr $(,)?) => {
        match $crate::errors::Outcome::into_outcome($outcome) {
            ::core::result::Result::Ok(value) => value,
            ::core::result::Result::Err(err) => {
                return ::core::result::Result::Err(
                    err.push_entry($crate::stack_entry!("propagate", stringify!($outcome))),
                );
            }
        }
    };
    ($outcome:expr, $($fmt:tt)+) => {
        match $crate::errors::Outcome::into_outcome($outcome) {
            ::core::result::Result::Ok(value) => value,
            ::core::result::Result::Err(err) => {
                return ::core::result::Result::Err(err.push_entry(
                    $crate::stack_entry!("propagate", stringify!($outcome))
                        .with_message(format!($($fmt)+)),
                ));
            }
        }
    };
}

/// Return a fresh error unless `cond` holds.
///
/// `ensure!(cond, kind = ErrorKind::Config, "fmt", ..)` picks the kind;
/// the default is [`ErrorKind::Internal`](crate::errors::ErrorKind::Internal).
#[macro_export]
macro_rules! ensure {
    ($cond:expr $(,)?) => {
        if !($cond) {
            return ::core::result::Result::Err($crate::errors::StackTraceError::from_entry(
                $crate::errors::ErrorKind::Internal,
                $crate::stack_entry!("ensure", stringify!($cond)),
            ));
        }
    };
    ($cond:expr, kind = $kind:expr $(,)?) => {
        if !($cond) {
            return ::core::result::Result::Err($crate::errors::StackTraceError::from_entry(
                $kind,
                $crate::stack_entry!("ensure", stringify!($cond)),
            ));
        }
    };
    ($cond:expr, kind = $kind:expr, $($fmt:tt)+) => {
        if !($cond) {
            return ::core::result::Result::Err($crate::errors::StackTraceError::from_entry(
                $kind,
                $crate::stack_entry!("ensure", stringify!($cond)).with_message(format!($($fmt)+)),
            ));
        }
    };
    ($cond:expr, $($fmt:tt)+) => {
        if !($cond) {
            return ::core::result::Result::Err($crate::errors::StackTraceError::from_entry(
                $crate::errors::ErrorKind::Internal,
                $crate::stack_entry!("ensure", stringify!($cond)).with_message(format!($($fmt)+)),
            ));
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __ensure_cmp {
    ($op:tt, $origin:literal, $a:expr, $b:expr) => {
        $crate::__ensure_cmp!($op, $origin, $a, $b, "")
    };
    ($op:tt, $origin:literal, $a:expr, $b:expr, $($fmt:tt)+) => {
        match (&$a, &$b) {
            (left, right) => {
                if !(*left $op *right) {
                    let extra = format!($($fmt)+);
                    let mut message = format!(
                        "expected {} {} {} ({:?} vs {:?})",
                        stringify!($a),
                        stringify!($op),
                        stringify!($b),
                        left,
                        right
                    );
                    if !extra.is_empty() {
                        message.push_str(": ");
                        message.push_str(&extra);
                    }
                    return ::core::result::Result::Err($crate::errors::StackTraceError::from_entry(
                        $crate::errors::ErrorKind::Internal,
                        $crate::stack_entry!($origin, concat!(stringify!($a), ", ", stringify!($b)))
                            .with_message(message),
                    ));
                }
            }
        }
    };
}

/// `ensure!` for `a == b`, recording both operand expressions and values.
#[macro_export]
macro_rules! ensure_eq {
    ($a:expr, $b:expr $(, $($fmt:tt)+)?) => {
        $crate::__ensure_cmp!(==, "ensure_eq", $a, $b $(, $($fmt)+)?)
    };
}

#[macro_export]
macro_rules! ensure_ne {
    ($a:expr, $b:expr $(, $($fmt:tt)+)?) => {
        $crate::__ensure_cmp!(!=, "ensure_ne", $a, $b $(, $($fmt)+)?)
    };
}

#[macro_export]
macro_rules! ensure_lt {
    ($a:expr, $b:expr $(, $($fmt:tt)+)?) => {
        $crate::__ensure_cmp!(<, "ensure_lt", $a, $b $(, $($fmt)+)?)
    };
}

#[macro_export]
macro_rules! ensure_le {
    ($a:expr, $b:expr $(, $($fmt:tt)+)?) => {
        $crate::__ensure_cmp!(<=, "ensure_le", $a, $b $(, $($fmt)+)?)
    };
}

#[macro_export]
macro_rules! ensure_gt {
    ($a:expr, $b:expr $(, $($fmt:tt)+)?) => {
        $crate::__ensure_cmp!(>, "ensure_gt", $a, $b $(, $($fmt)+)?)
    };
}

#[macro_export]
macro_rules! ensure_ge {
    ($a:expr, $b:expr $(, $($fmt:tt)+)?) => {
        $crate::__ensure_cmp!(>=, "ensure_ge", $a, $b $(, $($fmt)+)?)
    };
}

/// Build a single-frame error value (does not return).
#[macro_export]
macro_rules! stack_err {
    (kind = $kind:expr, $($fmt:tt)+) => {
        $crate::errors::StackTraceError::from_entry(
            $kind,
            $crate::stack_entry!().with_message(format!($($fmt)+)),
        )
    };
    ($($fmt:tt)+) => {
        $crate::errors::StackTraceError::from_entry(
            $crate::errors::ErrorKind::Internal,
            $crate::stack_entry!().with_message(format!($($fmt)+)),
        )
    };
}

/// Build a single-frame [`ErrorKind::Os`](crate::errors::ErrorKind::Os) error
/// from the current errno. The message is suffixed with its description.
#[macro_export]
macro_rules! errno_err {
    ($($fmt:tt)+) => {{
        let os_error = ::std::io::Error::last_os_error();
        let errno = os_error.raw_os_error().unwrap_or(0);
        $crate::errors::StackTraceError::from_entry(
            $crate::errors::ErrorKind::Os { errno },
            $crate::stack_entry!().with_message(format!("{}: {}", format!($($fmt)+), os_error)),
        )
    }};
}
