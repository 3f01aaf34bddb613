//! Process-wide symbol interning.
//!
//! Every [`Symbol`] with the same text is the same key, so symbols compare and
//! hash by identity and can be used directly as global-table keys.
use core::fmt;
use std::sync::LazyLock;

use lasso::{Spur, ThreadedRodeo};

static SYMBOL_TABLE: LazyLock<ThreadedRodeo> = LazyLock::new(ThreadedRodeo::new);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Spur);

impl Symbol {
    /// Returns the canonical symbol for `text`, creating it on first sight.
    pub fn intern(text: impl AsRef<str>) -> Self {
        Self(SYMBOL_TABLE.get_or_intern(text.as_ref()))
    }

    /// Looks a symbol up without creating it.
    pub fn get(text: impl AsRef<str>) -> Option<Self> {
        SYMBOL_TABLE.get(text.as_ref()).map(Self)
    }

    pub fn as_str(self) -> &'static str {
        SYMBOL_TABLE.resolve(&self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({:?})", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use assert2::check;

    use super::Symbol;

    #[test]
    fn interning_is_identity() {
        let a = Symbol::intern("lambda");
        let b = Symbol::intern(String::from("lambda"));
        check!(a == b);
        check!(a.as_str() == "lambda");
        check!(Symbol::intern("lambda") != Symbol::intern("define"));
    }

    #[test]
    fn lookup_does_not_intern() {
        check!(Symbol::get("never-seen-anywhere-else").is_none());
        let sym = Symbol::intern("seen-once");
        check!(Symbol::get("seen-once") == Some(sym));
    }
}
