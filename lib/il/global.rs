use crate::il::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A module-level variable.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct GlobalVariable {
    name: String,
    ty: Type,
    #[serde(default)]
    linkage: Linkage,
    /// `false` when the global is only declared in this module.
    defined: bool,
}

impl GlobalVariable {
    pub fn new<S>(name: S, ty: Type, linkage: Linkage) -> GlobalVariable
    where
        S: Into<String>,
    {
        GlobalVariable {
            name: name.into(),
            ty,
            linkage,
            defined: true,
        }
    }

    pub fn declaration<S>(name: S, ty: Type) -> GlobalVariable
    where
        S: Into<String>,
    {
        GlobalVariable {
            name: name.into(),
            ty,
            linkage: Linkage::External,
            defined: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn linkage(&self) -> Linkage {
        self.linkage
    }

    pub fn is_declaration(&self) -> bool {
        !self.defined
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.ty.size_in_bytes()
    }
}

impl fmt::Display for GlobalVariable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@{}: {} ({:?})", self.name, self.ty, self.linkage)?;
        if !self.defined {
            write!(f, " extern")?;
        }
        Ok(())
    }
}
