use crate::buffer::Buffer;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    Void,
    Byte,
    Boolean,
    Long,
    Float,
    String,
}

impl TypeCode {
    pub fn name(self) -> &'static str {
        match self {
            TypeCode::Void => "void",
            TypeCode::Byte => "byte",
            TypeCode::Boolean => "boolean",
            TypeCode::Long => "long",
            TypeCode::Float => "float",
            TypeCode::String => "string",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "void" => TypeCode::Void,
            "byte" => TypeCode::Byte,
            "boolean" => TypeCode::Boolean,
            "long" => TypeCode::Long,
            "float" => TypeCode::Float,
            "string" => TypeCode::String,
            _ => return None,
        })
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value whose type is only known at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyValue {
    Byte(u8),
    Boolean(bool),
    Long(i32),
    Float(f32),
    String(String),
}

impl AnyValue {
    pub fn type_code(&self) -> TypeCode {
        match self {
            AnyValue::Byte(_) => TypeCode::Byte,
            AnyValue::Boolean(_) => TypeCode::Boolean,
            AnyValue::Long(_) => TypeCode::Long,
            AnyValue::Float(_) => TypeCode::Float,
            AnyValue::String(_) => TypeCode::String,
        }
    }

    pub fn write_to(&self, buffer: &mut Buffer) {
        match self {
            AnyValue::Byte(v) => buffer.write_byte(*v),
            AnyValue::Boolean(v) => buffer.write_bool(*v),
            AnyValue::Long(v) => buffer.write_long(*v),
            AnyValue::Float(v) => buffer.write_float(*v),
            AnyValue::String(v) => buffer.write_string(v),
        }
    }

    /// `None` for `Void` or when the buffer ran dry.
    pub fn read_from(buffer: &mut Buffer, code: TypeCode) -> Option<Self> {
        let value = match code {
            TypeCode::Void => return None,
            TypeCode::Byte => AnyValue::Byte(buffer.read_byte()),
            TypeCode::Boolean => AnyValue::Boolean(buffer.read_bool()),
            TypeCode::Long => AnyValue::Long(buffer.read_long()),
            TypeCode::Float => AnyValue::Float(buffer.read_float()),
            TypeCode::String => AnyValue::String(buffer.read_string()),
        };
        (!buffer.read_error()).then_some(value)
    }
}

impl From<u8> for AnyValue {
    fn from(v: u8) -> Self {
        AnyValue::Byte(v)
    }
}

impl From<bool> for AnyValue {
    fn from(v: bool) -> Self {
        AnyValue::Boolean(v)
    }
}

impl From<i32> for AnyValue {
    fn from(v: i32) -> Self {
        AnyValue::Long(v)
    }
}

impl From<f32> for AnyValue {
    fn from(v: f32) -> Self {
        AnyValue::Float(v)
    }
}

impl From<&str> for AnyValue {
    fn from(v: &str) -> Self {
        AnyValue::String(v.to_string())
    }
}

impl From<String> for AnyValue {
    fn from(v: String) -> Self {
        AnyValue::String(v)
    }
}

/// Name, ordered parameter types and return type. Two signatures are the same
/// method only if all three match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    pub name: String,
    pub params: Vec<TypeCode>,
    pub return_type: TypeCode,
}

impl MethodSignature {
    pub fn new(name: &str, params: &[TypeCode], return_type: TypeCode) -> Self {
        Self {
            name: name.to_string(),
            params: params.to_vec(),
            return_type,
        }
    }

    /// Signature of a method that has not been named yet.
    pub fn unresolved() -> Self {
        Self::new("", &[], TypeCode::Void)
    }

    pub fn write_to(&self, buffer: &mut Buffer) {
        buffer.write_string(&self.name);
        buffer.write_string(self.return_type.name());
        buffer.write_long(self.params.len() as i32);
        for param in &self.params {
            buffer.write_string(param.name());
        }
    }

    pub fn read_from(buffer: &mut Buffer) -> Option<Self> {
        let name = buffer.read_string();
        let return_type = TypeCode::from_name(&buffer.read_string())?;
        let count = buffer.read_long();
        if count < 0 || buffer.read_error() {
            return None;
        }
        let params = (0..count)
            .map(|_| TypeCode::from_name(&buffer.read_string()))
            .collect::<Option<Vec<_>>>()?;
        (!buffer.read_error()).then_some(Self {
            name,
            params,
            return_type,
        })
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}(", self.return_type, self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        f.write_str(")")
    }
}
