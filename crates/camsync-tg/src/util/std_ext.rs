use easy_ext::ext;
use std::path::Path;

pub(crate) mod prelude {
    pub(crate) use super::ErrorExt as _;
    pub(crate) use super::PathExt as _;
}

#[ext(ErrorExt)]
pub(crate) impl<E> E
where
    E: std::error::Error + ?Sized,
{
    fn display_chain(&self) -> display_error_chain::DisplayErrorChain<&Self> {
        display_error_chain::DisplayErrorChain::new(self)
    }
}

#[ext(PathExt)]
pub(crate) impl Path {
    /// File name of the path for displaying it to humans. Falls back to the
    /// full path if there is no file name component.
    fn display_name(&self) -> String {
        self.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.display().to_string())
    }

    /// Case-insensitive check for the file extension (without the leading dot)
    fn has_extension(&self, expected: &str) -> bool {
        self.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(expected))
    }
}
