//! Constant packing into a shared upload buffer.

use crate::core::CompilationSession;
use crate::encode::layout::element_byte_size;
use crate::ir::{Function, IndexExpr, Lifetime, OpId, OpKind, Slice, Type};

/// Alignment of every constant inside the upload buffer.
pub const CONSTANT_ALIGNMENT: u64 = 16;

pub fn align_to(offset: u64, alignment: u64) -> u64 {
    offset.div_ceil(alignment) * alignment
}

/// Concatenates every statically sized constant of `func` into one
/// `resource.constants` op at the top of the body. Dynamically sized
/// constants get a dedicated allocation next to their upload.
pub fn pack_constants(func: &mut Function, session: &CompilationSession) -> Option<OpId> {
    let mut data: Vec<u8> = Vec::new();
    let mut slices = Vec::new();

    for op in func.walk() {
        let OpKind::AsyncConstant { value, size } = &func.op(op).kind else {
            continue;
        };
        let result = func.op(op).result();
        if func.value_type(result) != &Type::Resource(Lifetime::Constant) {
            continue;
        }
        let Some(bytes) = size.constant() else {
            let size = size.clone();
            log::warn!("@{}: constant %{} has a dynamic size, allocating it separately", func.name, func.value(result).name);
            let anchor = func.op(op).parent.unwrap_or(op);
            let alloc = func.insert_before(
                anchor,
                OpKind::ResourceAlloc {
                    size: size.clone(),
                    lifetime: Lifetime::Constant,
                    slices: vec![Slice { value: result, offset: IndexExpr::ZERO, length: size }],
                },
                "constant_storage",
            );
            log::trace!("@{}: dedicated {}", func.name, func.op(alloc).name());
            session.record_dedicated_allocation();
            continue;
        };

        let offset = align_to(data.len() as u64, CONSTANT_ALIGNMENT);
        data.resize(offset as usize, 0);
        let byte_size = element_byte_size(value.element);
        data.extend(value.to_bytes(bytes / byte_size, byte_size));
        log::trace!("@{}: constant %{} at [{offset}, {})", func.name, func.value(result).name, offset + bytes);
        slices.push(Slice { value: result, offset: IndexExpr::Const(offset), length: IndexExpr::Const(bytes) });
    }

    if slices.is_empty() {
        return None;
    }
    session.record_constants_packed(slices.len(), data.len() as u64);
    let packed = func.create_op(OpKind::ResourceConstants { data, slices }, "constants");
    func.set_value_type(func.op(packed).result(), Type::Resource(Lifetime::Constant));
    let mut body = vec![packed];
    body.extend_from_slice(func.body());
    func.set_body(body);
    Some(packed)
}

#[cfg(test)]
mod tests {
    use bumpalo::Bump;

    use super::*;
    use crate::ir::Module;
    use crate::lifetime::refine_usage;

    #[test]
    fn test_constants_are_packed_with_alignment() {
        let mut module = Module::parse(
            r#"
func @main() {
  %a = async.constant {value = dense<[1, 2, 3]> : i8, size = 3}
  %b = async.constant {value = dense<0x0102> : i16, size = 4}
  %s = async.splat {pattern = 0 : i8, size = 4}
  return(%s)
}
"#,
        )
        .unwrap();
        let func = &mut module.functions[0];
        refine_usage(func);
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let packed = pack_constants(func, &session).unwrap();

        assert_eq!(func.body()[0], packed);
        match &func.op(packed).kind {
            OpKind::ResourceConstants { data, slices } => {
                assert_eq!(data.len(), 20);
                assert_eq!(&data[..3], &[1, 2, 3]);
                assert_eq!(&data[16..], &[2, 1, 2, 1]);
                assert_eq!(slices.len(), 2);
                assert_eq!(slices[1].offset, IndexExpr::Const(16));
                assert_eq!(slices[1].length, IndexExpr::Const(4));
            }
            other => panic!("unexpected {}", other.name()),
        }
        let stats = session.finish();
        assert_eq!((stats.constants_packed, stats.constant_bytes), (2, 20));
    }

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 16), 0);
        assert_eq!(align_to(1, 16), 16);
        assert_eq!(align_to(32, 16), 32);
    }
}
