/// Builds an [`crate::Error`] from a variant of any of the module error enums
/// that convert into [`crate::error::ErrorKind`].
///
/// Every field value goes through [`Into`], so `err!(IoError::FileExists { path: &name })`
/// works with a borrowed `&String`. A field without a value is taken from the
/// local variable of the same name.
macro_rules! err {
    (@val $field:ident $value:expr) => ($value);
    (@val $field:ident) => ($field);
    ($variant:path $({
        $( $field:ident $(: $value:expr)? ),*
        $(,)?
    })?) => {{
        use $variant as Variant;

        $crate::error::Error::from(
            Variant $({$(
                $field: ::std::convert::Into::into(
                    $crate::error::err!(@val $field $($value)?)
                )
            ),*})?
        )
    }};
}

/// `map_err` closure that puts the original error into the `source` field
/// of the variant.
macro_rules! err_ctx {
    ($variant:path $({ $($fields:tt)* })?) => {
        |source| $crate::error::err!($variant { source, $($($fields)*)? })
    };
}

/// [`crate::error::ErrorKind::Fatal`] error with a formatted message
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::err!($crate::error::ErrorKind::Fatal {
            message: format!($($arg)*),
            source: None,
        })
    };
}

pub(crate) use err;
pub(crate) use err_ctx;
pub(crate) use fatal;
