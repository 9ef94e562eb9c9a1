//! Helper macros for logging (console printing).

/// Log TRACE message.
#[macro_export]
macro_rules! pf_trace {
    ($($arg:tt)*) => {
        ::log::trace!($($arg)*)
    };
}

/// Log DEBUG message.
#[macro_export]
macro_rules! pf_debug {
    ($($arg:tt)*) => {
        ::log::debug!($($arg)*)
    };
}

/// Log INFO message.
#[macro_export]
macro_rules! pf_info {
    ($($arg:tt)*) => {
        ::log::info!($($arg)*)
    };
}

/// Log WARN message.
#[macro_export]
macro_rules! pf_warn {
    ($($arg:tt)*) => {
        ::log::warn!($($arg)*)
    };
}

/// Log ERROR message.
#[macro_export]
macro_rules! pf_error {
    ($($arg:tt)*) => {
        ::log::error!($($arg)*)
    };
}

/// Log an error string to logger and then return a `ClusterError::Other`
/// containing the string.
///
/// Example:
/// ```no_run
/// use volary::logged_err;
/// use volary::utils::ClusterError;
/// let msg = "example";
/// let e: Result<(), ClusterError> = logged_err!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($fmt_str:literal $(, $fmt_arg:expr)*) => {{
        $crate::pf_error!($fmt_str $(, $fmt_arg)*);
        Err($crate::utils::ClusterError::Other(format!(
            $fmt_str $(, $fmt_arg)*
        )))
    }};
}

#[cfg(test)]
mod print_tests {
    use crate::utils::ClusterError;

    #[test]
    fn error_no_args() {
        assert_eq!(
            logged_err!("interesting message"),
            Err::<(), ClusterError>(ClusterError::Other(
                "interesting message".into()
            ))
        );
    }

    #[test]
    fn error_with_args() {
        assert_eq!(
            logged_err!("got {} to print", 777),
            Err::<(), ClusterError>(ClusterError::Other(
                "got 777 to print".into()
            ))
        );
    }
}
