//! Compile-time resolved variable locations

use std::fmt;
use std::rc::Rc;

/// Discriminant of a [`SymbolRef`], as stored in bytecode dumps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SymbolKind {
    Local = 0,
    Upvalue = 1,
    Global = 2,
    DefaultEnv = 3,
}

impl SymbolKind {
    pub(crate) fn from_u8(tag: u8) -> Option<SymbolKind> {
        match tag {
            0 => Some(SymbolKind::Local),
            1 => Some(SymbolKind::Upvalue),
            2 => Some(SymbolKind::Global),
            3 => Some(SymbolKind::DefaultEnv),
            _ => None,
        }
    }
}

/// Where a variable lives.
///
/// Locals index the current frame's slots, upvalues index the running
/// closure's captured cells, globals are looked up by name in whatever table
/// the `env` symbol evaluates to, and `DefaultEnv` is the global table itself.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolRef {
    Local { index: usize, name: Rc<str> },
    Upvalue { index: usize, name: Rc<str> },
    Global { name: Rc<str>, env: Rc<SymbolRef> },
    DefaultEnv,
}

impl SymbolRef {
    pub fn local(index: usize, name: &str) -> SymbolRef {
        SymbolRef::Local { index, name: name.into() }
    }

    pub fn upvalue(index: usize, name: &str) -> SymbolRef {
        SymbolRef::Upvalue { index, name: name.into() }
    }

    pub fn global(name: &str, env: SymbolRef) -> SymbolRef {
        SymbolRef::Global { name: name.into(), env: Rc::new(env) }
    }

    pub fn default_env() -> SymbolRef {
        SymbolRef::DefaultEnv
    }

    pub fn kind(&self) -> SymbolKind {
        match self {
            SymbolRef::Local { .. } => SymbolKind::Local,
            SymbolRef::Upvalue { .. } => SymbolKind::Upvalue,
            SymbolRef::Global { .. } => SymbolKind::Global,
            SymbolRef::DefaultEnv => SymbolKind::DefaultEnv,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SymbolRef::Local { name, .. }
            | SymbolRef::Upvalue { name, .. }
            | SymbolRef::Global { name, .. } => &name[..],
            SymbolRef::DefaultEnv => "_ENV",
        }
    }

    /// Slot or cell index; globals and the default env have none
    pub fn index(&self) -> Option<usize> {
        match self {
            SymbolRef::Local { index, .. } | SymbolRef::Upvalue { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn env(&self) -> Option<&SymbolRef> {
        match self {
            SymbolRef::Global { env, .. } => Some(env.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for SymbolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolRef::Local { index, name } => write!(f, "local {}[{}]", name, index),
            SymbolRef::Upvalue { index, name } => write!(f, "upvalue {}[{}]", name, index),
            SymbolRef::Global { name, env } => write!(f, "global {} in ({})", name, env),
            SymbolRef::DefaultEnv => f.write_str("default env"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_display() {
        let env = SymbolRef::upvalue(0, "_ENV");
        let g = SymbolRef::global("print", env.clone());
        assert_eq!(g.to_string(), "global print in (upvalue _ENV[0])");
        assert_eq!(g.env(), Some(&env));
        assert_eq!(g.index(), None);
        assert_eq!(SymbolRef::local(3, "x").index(), Some(3));
        assert_eq!(SymbolRef::default_env().name(), "_ENV");
    }
}
