//! Runtime struct layout descriptions and typed views over kernel
//! memory.
//!
//! The walkers never hardcode offsets; they go through a
//! [`TypeCatalog`] built from the target kernel's debug information.
//! The catalog supports capability probing ("does this type carry
//! field X"), which is what lets one binary tell the historical
//! `list_lru` shapes apart without a version number.

use std::collections::HashMap;

use memflow::types::Address;

use crate::target::KernelTarget;
use crate::{Error, Result};

/// Reference to a type as a field or view sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeRef {
    /// Named struct, resolved through the catalog.
    Struct(String),
    /// Pointer to another type. Member access on a pointer view reads
    /// the pointer and follows it, C arrow style.
    Pointer(Box<TypeRef>),
    /// Flexible array of elements; no declared bound, the caller
    /// supplies the index range.
    Array(Box<TypeRef>),
    /// Unsigned integer of the given byte width.
    UInt(usize),
    /// Signed integer of the given byte width.
    Int(usize),
    Bool,
}

impl TypeRef {
    pub fn structure(name: &str) -> TypeRef {
        TypeRef::Struct(name.to_string())
    }

    pub fn pointer(to: TypeRef) -> TypeRef {
        TypeRef::Pointer(Box::new(to))
    }

    pub fn struct_ptr(name: &str) -> TypeRef {
        TypeRef::pointer(TypeRef::structure(name))
    }

    pub fn array(of: TypeRef) -> TypeRef {
        TypeRef::Array(Box::new(of))
    }
}

#[derive(Clone, Debug)]
pub struct Field {
    pub offset: u64,
    pub ty: TypeRef,
}

#[derive(Clone, Debug, Default)]
pub struct StructDef {
    size: u64,
    fields: HashMap<String, Field>,
}

/// Struct layouts of the target kernel build, keyed by struct name.
#[derive(Clone, Debug, Default)]
pub struct TypeCatalog {
    structs: HashMap<String, StructDef>,
}

/// Chained helper returned by [`TypeCatalog::structure`].
pub struct StructBuilder<'a> {
    def: &'a mut StructDef,
}

impl<'a> StructBuilder<'a> {
    pub fn field(self, name: &str, offset: u64, ty: TypeRef) -> Self {
        self.def.fields.insert(name.to_string(), Field { offset, ty });
        self
    }
}

impl TypeCatalog {
    pub fn new() -> TypeCatalog {
        TypeCatalog::default()
    }

    /// Define (or redefine) a struct and return a builder for its
    /// fields.
    pub fn structure(&mut self, name: &str, size: u64) -> StructBuilder<'_> {
        let def = self.structs.entry(name.to_string()).or_default();
        def.size = size;
        def.fields.clear();
        StructBuilder { def }
    }

    fn struct_def(&self, name: &str) -> Result<&StructDef> {
        self.structs
            .get(name)
            .ok_or_else(|| Error::UnknownType(name.to_string()))
    }

    /// The struct a member lookup on `ty` would consult, looking
    /// through pointer and array indirection.
    fn aggregate_name<'t>(&self, ty: &'t TypeRef) -> Option<&'t str> {
        match ty {
            TypeRef::Struct(name) => Some(name),
            TypeRef::Pointer(to) | TypeRef::Array(to) => self.aggregate_name(to),
            _ => None,
        }
    }

    /// Capability probe: does `ty` carry a member called `field`?
    /// Unknown types and scalars probe as `false`, never as an error.
    pub fn has_field(&self, ty: &TypeRef, field: &str) -> bool {
        match self.aggregate_name(ty) {
            Some(name) => self
                .structs
                .get(name)
                .map_or(false, |d| d.fields.contains_key(field)),
            None => false,
        }
    }

    pub fn field(&self, ty: &TypeRef, field: &str) -> Result<&Field> {
        let name = self
            .aggregate_name(ty)
            .ok_or(Error::InvalidAccess("member access on a scalar type"))?;
        self.struct_def(name)?
            .fields
            .get(field)
            .ok_or_else(|| Error::MissingField(name.to_string(), field.to_string()))
    }

    /// Offset of `member` inside the named struct.
    pub fn member_offset(&self, type_name: &str, member: &str) -> Result<u64> {
        Ok(self.field(&TypeRef::structure(type_name), member)?.offset)
    }

    pub fn size_of(&self, ty: &TypeRef) -> Result<u64> {
        match ty {
            TypeRef::Struct(name) => Ok(self.struct_def(name)?.size),
            TypeRef::Pointer(_) => Ok(8),
            TypeRef::UInt(w) | TypeRef::Int(w) => Ok(*w as u64),
            TypeRef::Bool => Ok(1),
            TypeRef::Array(_) => Err(Error::InvalidAccess("flexible arrays have no size")),
        }
    }
}

/// A typed window over kernel memory: an address plus the type that
/// governs how members and elements are reached from it. Views are
/// cheap descriptions; nothing is read until a scalar read or a
/// pointer hop asks for it.
#[derive(Clone, Debug)]
pub struct View {
    pub addr: Address,
    pub ty: TypeRef,
}

impl View {
    pub fn new(addr: Address, ty: TypeRef) -> View {
        View { addr, ty }
    }

    /// Reinterpret the same address as a different type.
    pub fn cast(&self, ty: TypeRef) -> View {
        View::new(self.addr, ty)
    }

    pub fn has_field(&self, types: &TypeCatalog, field: &str) -> bool {
        types.has_field(&self.ty, field)
    }

    /// Follow a pointer view to its pointee.
    pub fn deref(&self, mem: &mut impl KernelTarget) -> Result<View> {
        match &self.ty {
            TypeRef::Pointer(to) => {
                let ptr = mem.read_u64(self.addr)?;
                Ok(View::new(Address::from(ptr), (**to).clone()))
            }
            _ => Err(Error::InvalidAccess("deref of a non-pointer view")),
        }
    }

    /// Member access. On pointer views the pointer is read and
    /// followed first.
    pub fn field(
        &self,
        types: &TypeCatalog,
        mem: &mut impl KernelTarget,
        name: &str,
    ) -> Result<View> {
        let base = match self.ty {
            TypeRef::Pointer(_) => self.deref(mem)?,
            _ => self.clone(),
        };
        let f = types.field(&base.ty, name)?;
        Ok(View::new(
            Address::from(base.addr.to_umem() as u64 + f.offset),
            f.ty.clone(),
        ))
    }

    /// Element access on an array or pointer view.
    pub fn index(
        &self,
        types: &TypeCatalog,
        mem: &mut impl KernelTarget,
        idx: u64,
    ) -> Result<View> {
        match &self.ty {
            TypeRef::Pointer(to) => {
                let base = mem.read_u64(self.addr)?;
                let elem = types.size_of(to)?;
                Ok(View::new(Address::from(base + idx * elem), (**to).clone()))
            }
            TypeRef::Array(of) => {
                let elem = types.size_of(of)?;
                Ok(View::new(
                    Address::from(self.addr.to_umem() as u64 + idx * elem),
                    (**of).clone(),
                ))
            }
            _ => Err(Error::InvalidAccess("indexing a non-array view")),
        }
    }

    /// Read the scalar this view covers, zero extended. Pointer views
    /// read as their raw word, which is how tagged pointers are
    /// inspected.
    pub fn read(&self, mem: &mut impl KernelTarget) -> Result<u64> {
        match &self.ty {
            TypeRef::UInt(w) | TypeRef::Int(w) => mem.read_uint(self.addr, *w),
            TypeRef::Bool => mem.read_uint(self.addr, 1),
            TypeRef::Pointer(_) => mem.read_u64(self.addr),
            _ => Err(Error::InvalidAccess("scalar read of an aggregate view")),
        }
    }

    /// Read the scalar sign extended; unsigned types zero extend.
    pub fn read_signed(&self, mem: &mut impl KernelTarget) -> Result<i64> {
        match &self.ty {
            TypeRef::Int(w) => mem.read_int(self.addr, *w),
            _ => Ok(self.read(mem)? as i64),
        }
    }

    pub fn read_bool(&self, mem: &mut impl KernelTarget) -> Result<bool> {
        Ok(self.read(mem)? != 0)
    }

    /// Null test on a pointer view.
    pub fn is_null(&self, mem: &mut impl KernelTarget) -> Result<bool> {
        match &self.ty {
            TypeRef::Pointer(_) => Ok(mem.read_u64(self.addr)? == 0),
            _ => Err(Error::InvalidAccess("null test on a non-pointer view")),
        }
    }
}
