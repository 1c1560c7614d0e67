//! Method descriptor parsing, e.g. `(ILjava/lang/String;[J)V`

use super::DecodeError;

/// A parameter's type as the verifier sees it in a local slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterType {
    /// boolean, byte, char, short and int all verify as int
    Int,
    Float,
    Long,
    Double,
    /// Internal class name, or the full descriptor for array types
    Reference(String),
}

pub fn parameter_types(descriptor: &str) -> Result<Vec<ParameterType>, DecodeError> {
    let bad = || DecodeError::BadDescriptor(descriptor.to_string());

    let params = descriptor
        .strip_prefix('(')
        .and_then(|rest| rest.split_once(')'))
        .map(|(params, _ret)| params)
        .ok_or_else(bad)?;

    let bytes = params.as_bytes();
    let mut types = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        while bytes[i] == b'[' {
            i += 1;
            if i >= bytes.len() {
                return Err(bad());
            }
        }
        let is_array = i > start;
        let end = match bytes[i] {
            b'B' | b'C' | b'I' | b'S' | b'Z' | b'F' | b'J' | b'D' => i + 1,
            b'L' => params[i..].find(';').map(|p| i + p + 1).ok_or_else(bad)?,
            _ => return Err(bad()),
        };

        let ty = if is_array {
            ParameterType::Reference(params[start..end].to_string())
        } else {
            match bytes[i] {
                b'F' => ParameterType::Float,
                b'J' => ParameterType::Long,
                b'D' => ParameterType::Double,
                b'L' => ParameterType::Reference(params[i + 1..end - 1].to_string()),
                _ => ParameterType::Int,
            }
        };
        types.push(ty);
        i = end;
    }

    Ok(types)
}
