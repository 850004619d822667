//! Named data types, canonical printing, sizes, and the type-id registry.

use std::collections::HashMap;

use crate::ast::{Ast, ClassId, FnId};
use crate::intern::Interner;

#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    Void,
    Null,
    Any,
    Bool,
    Char,
    Int,
    Float,
    Str,
    /// `dims` counts nested array dimensions over the base element type.
    Array { dims: u8, elem: Box<DataType> },
    Object(ClassId),
    Alias(Box<DataType>),
    Prototype(ClassId),
    PrototypeTemplate(ClassId),
    Function(FnId),
    FunctionMember(FnId),
    FunctionInternal {
        name: &'static str,
        params: Vec<DataType>,
        ret: Box<DataType>,
    },
    FunctionPointer {
        params: Vec<DataType>,
        ret: Box<DataType>,
    },
    FunctionTemplate(FnId),
    FunctionGroup(Vec<FnId>),
}

impl DataType {
    pub fn array(elem: DataType) -> DataType {
        match elem {
            DataType::Array { dims, elem } => DataType::Array { dims: dims + 1, elem },
            other => DataType::Array { dims: 1, elem: Box::new(other) },
        }
    }

    /// First positional element type; multi-dimensional arrays nest.
    pub fn element(&self) -> DataType {
        match self {
            DataType::Array { dims, elem } if *dims > 1 => {
                DataType::Array { dims: dims - 1, elem: elem.clone() }
            }
            DataType::Array { elem, .. } => (**elem).clone(),
            other => other.clone(),
        }
    }

    /// Byte size for types that may live in arrays and fields.
    pub fn size(&self) -> u32 {
        match self {
            DataType::Bool | DataType::Char => 1,
            DataType::Int | DataType::Float => 4,
            _ => 8,
        }
    }

    /// Field layout is sequential; only pointer-shaped fields are
    /// aligned to the natural word.
    pub fn align(&self) -> u32 {
        if self.size() == 8 {
            8
        } else {
            1
        }
    }

    pub fn primitive(&self) -> bool {
        matches!(self, DataType::Bool | DataType::Char | DataType::Int | DataType::Float)
    }

    /// Shapes a null literal may inhabit.
    pub fn nullable(&self) -> bool {
        matches!(
            self,
            DataType::Object(_) | DataType::FunctionPointer { .. } | DataType::Any
        )
    }

    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            DataType::Str
                | DataType::Array { .. }
                | DataType::Object(_)
                | DataType::FunctionPointer { .. }
                | DataType::Any
                | DataType::Null
        )
    }

    pub fn is_callable_decl(&self) -> bool {
        matches!(
            self,
            DataType::Function(_)
                | DataType::FunctionMember(_)
                | DataType::FunctionInternal { .. }
        )
    }
}

/// Canonical textual form of a type; injective over structurally distinct
/// types and used as the identity key in every backend map.
pub fn canonical_name(ty: &DataType, ast: &Ast, interner: &Interner) -> String {
    match ty {
        DataType::Void => "void".to_string(),
        DataType::Null => "null".to_string(),
        DataType::Any => "any".to_string(),
        DataType::Bool => "bool".to_string(),
        DataType::Char => "char".to_string(),
        DataType::Int => "int".to_string(),
        DataType::Float => "float".to_string(),
        DataType::Str => "string".to_string(),
        DataType::Array { .. } => {
            format!("array<{}>", canonical_name(&ty.element(), ast, interner))
        }
        DataType::Object(class) | DataType::Prototype(class) | DataType::PrototypeTemplate(class) => {
            let class = ast.class(*class);
            if class.mangled.is_empty() {
                interner.resolve(class.name.lexeme).to_string()
            } else {
                class.mangled.clone()
            }
        }
        DataType::Alias(target) => canonical_name(target, ast, interner),
        DataType::Function(func) | DataType::FunctionMember(func) => {
            let func = ast.func(*func);
            let params: Vec<String> = func
                .params
                .iter()
                .map(|&p| canonical_name(&ast.var(p).ty, ast, interner))
                .collect();
            format!("{}({})", canonical_name(&func.ret, ast, interner), params.join(", "))
        }
        DataType::FunctionInternal { params, ret, .. }
        | DataType::FunctionPointer { params, ret } => {
            let params: Vec<String> =
                params.iter().map(|p| canonical_name(p, ast, interner)).collect();
            format!("{}({})", canonical_name(ret, ast, interner), params.join(", "))
        }
        DataType::FunctionTemplate(func) => {
            format!("template {}", interner.resolve(ast.func(*func).name.lexeme))
        }
        DataType::FunctionGroup(funcs) => {
            let name = funcs
                .first()
                .map(|&f| interner.resolve(ast.func(f).name.lexeme))
                .unwrap_or("");
            format!("group {}", name)
        }
    }
}

/// Signature string for call sites and signatures printed in errors:
/// `ret(p1, p2)` over already-resolved parameter types.
pub fn signature_name(params: &[DataType], ret: &DataType, ast: &Ast, interner: &Interner) -> String {
    let params: Vec<String> = params.iter().map(|p| canonical_name(p, ast, interner)).collect();
    format!("{}({})", canonical_name(ret, ast, interner), params.join(", "))
}

/// Monotonic registry of 16-bit type ids keyed by canonical name.
/// Id zero is reserved; the first registered type yields id 1.
#[derive(Default)]
pub struct TypeIds {
    ids: HashMap<String, u16>,
}

impl TypeIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&mut self, canonical: &str) -> u16 {
        if let Some(&id) = self.ids.get(canonical) {
            return id;
        }
        let id = (self.ids.len() + 1) as u16;
        self.ids.insert(canonical.to_string(), id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_match_storage_layout() {
        assert_eq!(DataType::Bool.size(), 1);
        assert_eq!(DataType::Char.size(), 1);
        assert_eq!(DataType::Int.size(), 4);
        assert_eq!(DataType::Float.size(), 4);
        assert_eq!(DataType::Str.size(), 8);
        assert_eq!(DataType::array(DataType::Int).size(), 8);
        assert_eq!(DataType::Any.size(), 8);
    }

    #[test]
    fn array_nesting_counts_dimensions() {
        let nested = DataType::array(DataType::array(DataType::Int));
        assert_eq!(nested, DataType::Array { dims: 2, elem: Box::new(DataType::Int) });
        assert_eq!(nested.element(), DataType::array(DataType::Int));
        assert_eq!(nested.element().element(), DataType::Int);
    }

    #[test]
    fn canonical_names_are_distinct_for_distinct_types() {
        let ast = Ast::new();
        let interner = Interner::new();
        let names = [
            canonical_name(&DataType::Int, &ast, &interner),
            canonical_name(&DataType::array(DataType::Int), &ast, &interner),
            canonical_name(&DataType::array(DataType::array(DataType::Int)), &ast, &interner),
            canonical_name(&DataType::Str, &ast, &interner),
            canonical_name(
                &DataType::FunctionPointer {
                    params: vec![DataType::Int, DataType::Int],
                    ret: Box::new(DataType::Int),
                },
                &ast,
                &interner,
            ),
        ];
        for (i, a) in names.iter().enumerate() {
            for b in names.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
        assert_eq!(names[1], "array<int>");
        assert_eq!(names[2], "array<array<int>>");
        assert_eq!(names[4], "int(int, int)");
    }

    #[test]
    fn first_type_id_is_one() {
        let mut ids = TypeIds::new();
        assert_eq!(ids.id("int"), 1);
        assert_eq!(ids.id("string"), 2);
        assert_eq!(ids.id("int"), 1);
    }
}
