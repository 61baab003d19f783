//! Section-level decoding of the Wasm binary format.

use super::reader::Reader;
use super::types::*;
use super::DecodeError;
use tracing::debug;

const MAGIC: &[u8; 4] = b"\0asm";
const VERSION: u32 = 1;

/// Decode a complete module binary.
pub fn decode_module(bytes: &[u8]) -> Result<Module, DecodeError> {
    let mut r = Reader::new(bytes);

    if r.read_bytes(4).map_err(|_| DecodeError::BadMagic)? != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = r.read_u32().map_err(|_| DecodeError::BadVersion(0))?;
    if version != VERSION {
        return Err(DecodeError::BadVersion(version));
    }

    let mut module = Module::default();
    let mut last_order: u8 = 0;
    let mut func_count_declared = 0usize;
    let mut data_count: Option<u32> = None;

    while !r.is_empty() {
        let sec_offset = r.pos();
        let id = r.read_u8()?;
        let size = r.read_var_u32()? as usize;
        if r.remaining() < size {
            return Err(DecodeError::UnexpectedEof { offset: r.pos() });
        }
        let body_start = r.pos();
        let body = r.read_bytes(size)?;

        if id == 0 {
            // Custom sections carry a name followed by opaque bytes; skip.
            let mut cr = Reader::new(body);
            let _ = cr.read_name();
            continue;
        }

        let order = section_order(id)
            .ok_or_else(|| DecodeError::section(sec_offset, format!("unknown section id {id}")))?;
        if order <= last_order {
            return Err(DecodeError::SectionOutOfOrder {
                id,
                offset: sec_offset,
            });
        }
        last_order = order;

        let mut sr = SectionReader {
            r: Reader::new(body),
            base: body_start,
        };
        match id {
            1 => decode_type_section(&mut sr, &mut module)?,
            2 => decode_import_section(&mut sr, &mut module)?,
            3 => {
                let count = sr.r.read_var_u32()? as usize;
                for _ in 0..count {
                    let offset = sr.pos();
                    let idx = sr.r.read_var_u32()?;
                    if idx as usize >= module.types.len() {
                        return Err(DecodeError::IndexOutOfRange {
                            space: "type",
                            index: idx,
                            offset,
                        });
                    }
                    module.funcs.push(idx);
                }
                func_count_declared = count;
            }
            4 => decode_table_section(&mut sr, &mut module)?,
            5 => decode_memory_section(&mut sr, &mut module)?,
            6 => decode_global_section(&mut sr, &mut module)?,
            7 => decode_export_section(&mut sr, &mut module)?,
            8 => {
                let offset = sr.pos();
                let idx = sr.r.read_var_u32()?;
                if idx >= module.num_funcs() {
                    return Err(DecodeError::IndexOutOfRange {
                        space: "function",
                        index: idx,
                        offset,
                    });
                }
                module.start = Some(idx);
            }
            9 => decode_element_section(&mut sr, &mut module)?,
            12 => data_count = Some(sr.r.read_var_u32()?),
            10 => decode_code_section(&mut sr, &mut module, func_count_declared)?,
            11 => decode_data_section(&mut sr, &mut module)?,
            _ => unreachable!("section_order filtered unknown ids"),
        }
        if !sr.r.is_empty() {
            return Err(DecodeError::section(
                sr.pos(),
                format!("trailing bytes in section {id}"),
            ));
        }
    }

    if module.codes.len() != func_count_declared {
        return Err(DecodeError::section(
            bytes.len(),
            format!(
                "function section declares {} bodies, code section has {}",
                func_count_declared,
                module.codes.len()
            ),
        ));
    }
    if let Some(n) = data_count {
        if n as usize != module.datas.len() {
            return Err(DecodeError::section(
                bytes.len(),
                format!(
                    "data count section declares {} segments, data section has {}",
                    n,
                    module.datas.len()
                ),
            ));
        }
    }

    debug!(
        types = module.types.len(),
        funcs = module.funcs.len(),
        imports = module.imported_funcs.len(),
        "decoded module"
    );
    Ok(module)
}

/// A reader over one section body that reports absolute module offsets.
struct SectionReader<'a> {
    r: Reader<'a>,
    base: usize,
}

impl SectionReader<'_> {
    fn pos(&self) -> usize {
        self.base + self.r.pos()
    }
}

/// Ordinal position of a non-custom section; data-count sits between
/// element and code.
fn section_order(id: u8) -> Option<u8> {
    match id {
        1 => Some(1),
        2 => Some(2),
        3 => Some(3),
        4 => Some(4),
        5 => Some(5),
        6 => Some(6),
        7 => Some(7),
        8 => Some(8),
        9 => Some(9),
        12 => Some(10),
        10 => Some(11),
        11 => Some(12),
        _ => None,
    }
}

fn decode_val_type(sr: &mut SectionReader) -> Result<ValType, DecodeError> {
    let offset = sr.pos();
    let byte = sr.r.read_u8()?;
    val_type_from_byte(byte).ok_or(DecodeError::InvalidValueType { byte, offset })
}

pub(crate) fn val_type_from_byte(byte: u8) -> Option<ValType> {
    match byte {
        0x7F => Some(ValType::I32),
        0x7E => Some(ValType::I64),
        0x7D => Some(ValType::F32),
        0x7C => Some(ValType::F64),
        0x7B => Some(ValType::V128),
        0x70 => Some(ValType::FuncRef),
        0x6F => Some(ValType::ExternRef),
        _ => None,
    }
}

fn decode_type_section(sr: &mut SectionReader, module: &mut Module) -> Result<(), DecodeError> {
    let count = sr.r.read_var_u32()? as usize;
    for _ in 0..count {
        let offset = sr.pos();
        let form = sr.r.read_u8()?;
        if form != 0x60 {
            return Err(DecodeError::section(
                offset,
                format!("expected function type form 0x60, found 0x{form:02x}"),
            ));
        }
        let nparams = sr.r.read_var_u32()? as usize;
        let mut params = Vec::with_capacity(nparams);
        for _ in 0..nparams {
            params.push(decode_val_type(sr)?);
        }
        let nresults = sr.r.read_var_u32()? as usize;
        let mut results = Vec::with_capacity(nresults);
        for _ in 0..nresults {
            results.push(decode_val_type(sr)?);
        }
        module.types.push(FuncType::new(params, results));
    }
    Ok(())
}

fn decode_import_section(sr: &mut SectionReader, module: &mut Module) -> Result<(), DecodeError> {
    let count = sr.r.read_var_u32()? as usize;
    for _ in 0..count {
        let module_name = sr.r.read_name()?;
        let name = sr.r.read_name()?;
        let offset = sr.pos();
        let kind = sr.r.read_u8()?;
        match kind {
            0x00 => {
                let type_idx = sr.r.read_var_u32()?;
                if type_idx as usize >= module.types.len() {
                    return Err(DecodeError::IndexOutOfRange {
                        space: "type",
                        index: type_idx,
                        offset,
                    });
                }
                module.imported_funcs.push(ImportedFunc {
                    module: module_name,
                    name,
                    type_idx,
                });
            }
            // Table, memory, and global imports are outside this engine's
            // linking model.
            0x01..=0x03 => {
                return Err(DecodeError::UnknownImport {
                    module: module_name,
                    name,
                })
            }
            _ => {
                return Err(DecodeError::section(
                    offset,
                    format!("invalid import kind 0x{kind:02x}"),
                ))
            }
        }
    }
    Ok(())
}

fn decode_limits(sr: &mut SectionReader) -> Result<(Limits, bool), DecodeError> {
    let offset = sr.pos();
    let flags = sr.r.read_u8()?;
    let (has_max, shared) = match flags {
        0x00 => (false, false),
        0x01 => (true, false),
        0x03 => (true, true),
        _ => {
            return Err(DecodeError::section(
                offset,
                format!("invalid limits flags 0x{flags:02x}"),
            ))
        }
    };
    let min = sr.r.read_var_u32()?;
    let max = if has_max {
        let max = sr.r.read_var_u32()?;
        if max < min {
            return Err(DecodeError::section(
                offset,
                format!("limits maximum {max} below minimum {min}"),
            ));
        }
        Some(max)
    } else {
        None
    };
    Ok((Limits { min, max }, shared))
}

fn decode_table_section(sr: &mut SectionReader, module: &mut Module) -> Result<(), DecodeError> {
    let count = sr.r.read_var_u32()? as usize;
    for _ in 0..count {
        let offset = sr.pos();
        let elem = decode_val_type(sr)?;
        if !elem.is_ref() {
            return Err(DecodeError::section(offset, "table element must be a reftype"));
        }
        let (limits, shared) = decode_limits(sr)?;
        if shared {
            return Err(DecodeError::section(offset, "tables cannot be shared"));
        }
        module.tables.push(TableType { elem, limits });
    }
    Ok(())
}

fn decode_memory_section(sr: &mut SectionReader, module: &mut Module) -> Result<(), DecodeError> {
    let count = sr.r.read_var_u32()? as usize;
    for _ in 0..count {
        let offset = sr.pos();
        if !module.memories.is_empty() {
            return Err(DecodeError::section(offset, "at most one memory is supported"));
        }
        let (limits, shared) = decode_limits(sr)?;
        if limits.min > MAX_PAGES || limits.max.is_some_and(|m| m > MAX_PAGES) {
            return Err(DecodeError::section(
                offset,
                format!("memory limits exceed {MAX_PAGES} pages"),
            ));
        }
        module.memories.push(MemoryType { limits, shared });
    }
    Ok(())
}

fn decode_const_expr(
    sr: &mut SectionReader,
    module: &Module,
    expected: ValType,
) -> Result<ConstExpr, DecodeError> {
    let offset = sr.pos();
    let opcode = sr.r.read_u8()?;
    let expr = match opcode {
        0x41 => ConstExpr::I32(sr.r.read_var_i32()?),
        0x42 => ConstExpr::I64(sr.r.read_var_i64()?),
        0x43 => ConstExpr::F32(sr.r.read_f32_bits()?),
        0x44 => ConstExpr::F64(sr.r.read_f64_bits()?),
        0xFD => {
            let sub = sr.r.read_var_u32()?;
            if sub != 12 {
                return Err(DecodeError::section(offset, "expected v128.const"));
            }
            let bytes = sr.r.read_bytes(16)?;
            let mut buf = [0u8; 16];
            buf.copy_from_slice(bytes);
            ConstExpr::V128(u128::from_le_bytes(buf))
        }
        0xD0 => {
            let _ = decode_val_type(sr)?;
            ConstExpr::RefNull
        }
        0xD2 => {
            let idx = sr.r.read_var_u32()?;
            if idx >= module.num_funcs() {
                return Err(DecodeError::IndexOutOfRange {
                    space: "function",
                    index: idx,
                    offset,
                });
            }
            ConstExpr::RefFunc(idx)
        }
        // global.get of an imported global; this engine links no global
        // imports, so there is nothing it could refer to.
        0x23 => {
            return Err(DecodeError::section(
                offset,
                "global.get is not supported in constant expressions",
            ))
        }
        _ => {
            return Err(DecodeError::section(
                offset,
                format!("invalid constant expression opcode 0x{opcode:02x}"),
            ))
        }
    };
    let end = sr.r.read_u8()?;
    if end != 0x0B {
        return Err(DecodeError::section(offset, "unterminated constant expression"));
    }
    let actual = match expr {
        ConstExpr::I32(_) => ValType::I32,
        ConstExpr::I64(_) => ValType::I64,
        ConstExpr::F32(_) => ValType::F32,
        ConstExpr::F64(_) => ValType::F64,
        ConstExpr::V128(_) => ValType::V128,
        ConstExpr::RefNull | ConstExpr::RefFunc(_) => ValType::FuncRef,
    };
    let matches = actual == expected || (expected.is_ref() && actual.is_ref());
    if !matches {
        return Err(DecodeError::TypeMismatch {
            offset,
            message: format!("constant expression has type {actual:?}, expected {expected:?}"),
        });
    }
    Ok(expr)
}

fn decode_global_section(sr: &mut SectionReader, module: &mut Module) -> Result<(), DecodeError> {
    let count = sr.r.read_var_u32()? as usize;
    for _ in 0..count {
        let val = decode_val_type(sr)?;
        let offset = sr.pos();
        let mutability = sr.r.read_u8()?;
        let mutable = match mutability {
            0x00 => false,
            0x01 => true,
            _ => {
                return Err(DecodeError::section(
                    offset,
                    format!("invalid global mutability 0x{mutability:02x}"),
                ))
            }
        };
        let init = decode_const_expr(sr, module, val)?;
        module.globals.push(Global {
            ty: GlobalType { val, mutable },
            init,
        });
    }
    Ok(())
}

fn decode_export_section(sr: &mut SectionReader, module: &mut Module) -> Result<(), DecodeError> {
    let count = sr.r.read_var_u32()? as usize;
    for _ in 0..count {
        let name = sr.r.read_name()?;
        let offset = sr.pos();
        let kind_byte = sr.r.read_u8()?;
        let index = sr.r.read_var_u32()?;
        let (kind, bound) = match kind_byte {
            0x00 => (ExternalKind::Func, module.num_funcs()),
            0x01 => (ExternalKind::Table, module.tables.len() as u32),
            0x02 => (ExternalKind::Memory, module.memories.len() as u32),
            0x03 => (ExternalKind::Global, module.globals.len() as u32),
            _ => {
                return Err(DecodeError::section(
                    offset,
                    format!("invalid export kind 0x{kind_byte:02x}"),
                ))
            }
        };
        if index >= bound {
            return Err(DecodeError::IndexOutOfRange {
                space: "export target",
                index,
                offset,
            });
        }
        if module.exports.iter().any(|e| e.name == name) {
            return Err(DecodeError::DuplicateExport(name));
        }
        module.exports.push(Export { name, kind, index });
    }
    Ok(())
}

fn decode_elem_func_indices(
    sr: &mut SectionReader,
    module: &Module,
) -> Result<Vec<Option<u32>>, DecodeError> {
    let count = sr.r.read_var_u32()? as usize;
    let mut funcs = Vec::with_capacity(count);
    for _ in 0..count {
        let offset = sr.pos();
        let idx = sr.r.read_var_u32()?;
        if idx >= module.num_funcs() {
            return Err(DecodeError::IndexOutOfRange {
                space: "function",
                index: idx,
                offset,
            });
        }
        funcs.push(Some(idx));
    }
    Ok(funcs)
}

fn decode_elem_exprs(
    sr: &mut SectionReader,
    module: &Module,
) -> Result<Vec<Option<u32>>, DecodeError> {
    let count = sr.r.read_var_u32()? as usize;
    let mut funcs = Vec::with_capacity(count);
    for _ in 0..count {
        let expr = decode_const_expr(sr, module, ValType::FuncRef)?;
        funcs.push(match expr {
            ConstExpr::RefFunc(idx) => Some(idx),
            _ => None,
        });
    }
    Ok(funcs)
}

fn decode_element_section(sr: &mut SectionReader, module: &mut Module) -> Result<(), DecodeError> {
    let count = sr.r.read_var_u32()? as usize;
    for _ in 0..count {
        let offset = sr.pos();
        let flags = sr.r.read_var_u32()?;
        let segment = match flags {
            0 => {
                let off = decode_const_expr(sr, module, ValType::I32)?;
                ElementSegment {
                    mode: ElemMode::Active {
                        table_index: 0,
                        offset: off,
                    },
                    funcs: decode_elem_func_indices(sr, module)?,
                }
            }
            1 | 3 => {
                let kind = sr.r.read_u8()?;
                if kind != 0x00 {
                    return Err(DecodeError::section(offset, "invalid element kind"));
                }
                ElementSegment {
                    mode: if flags == 1 {
                        ElemMode::Passive
                    } else {
                        ElemMode::Declared
                    },
                    funcs: decode_elem_func_indices(sr, module)?,
                }
            }
            2 => {
                let table_index = sr.r.read_var_u32()?;
                let off = decode_const_expr(sr, module, ValType::I32)?;
                let kind = sr.r.read_u8()?;
                if kind != 0x00 {
                    return Err(DecodeError::section(offset, "invalid element kind"));
                }
                ElementSegment {
                    mode: ElemMode::Active {
                        table_index,
                        offset: off,
                    },
                    funcs: decode_elem_func_indices(sr, module)?,
                }
            }
            4 => {
                let off = decode_const_expr(sr, module, ValType::I32)?;
                ElementSegment {
                    mode: ElemMode::Active {
                        table_index: 0,
                        offset: off,
                    },
                    funcs: decode_elem_exprs(sr, module)?,
                }
            }
            5 | 7 => {
                let elem = decode_val_type(sr)?;
                if !elem.is_ref() {
                    return Err(DecodeError::section(offset, "element type must be a reftype"));
                }
                ElementSegment {
                    mode: if flags == 5 {
                        ElemMode::Passive
                    } else {
                        ElemMode::Declared
                    },
                    funcs: decode_elem_exprs(sr, module)?,
                }
            }
            6 => {
                let table_index = sr.r.read_var_u32()?;
                let off = decode_const_expr(sr, module, ValType::I32)?;
                let elem = decode_val_type(sr)?;
                if !elem.is_ref() {
                    return Err(DecodeError::section(offset, "element type must be a reftype"));
                }
                ElementSegment {
                    mode: ElemMode::Active {
                        table_index,
                        offset: off,
                    },
                    funcs: decode_elem_exprs(sr, module)?,
                }
            }
            _ => {
                return Err(DecodeError::section(
                    offset,
                    format!("invalid element segment flags {flags}"),
                ))
            }
        };
        if let ElemMode::Active { table_index, .. } = segment.mode {
            if table_index as usize >= module.tables.len() {
                return Err(DecodeError::IndexOutOfRange {
                    space: "table",
                    index: table_index,
                    offset,
                });
            }
        }
        module.elems.push(segment);
    }
    Ok(())
}

fn decode_code_section(
    sr: &mut SectionReader,
    module: &mut Module,
    declared: usize,
) -> Result<(), DecodeError> {
    let count = sr.r.read_var_u32()? as usize;
    if count != declared {
        return Err(DecodeError::section(
            sr.pos(),
            format!("code count {count} does not match function count {declared}"),
        ));
    }
    for _ in 0..count {
        let size = sr.r.read_var_u32()? as usize;
        let body_end = sr.r.pos() + size;
        if size > sr.r.remaining() {
            return Err(DecodeError::UnexpectedEof { offset: sr.pos() });
        }

        let local_count = sr.r.read_var_u32()? as usize;
        let mut locals = Vec::new();
        for _ in 0..local_count {
            let n = sr.r.read_var_u32()? as usize;
            let ty = decode_val_type(sr)?;
            if locals.len() + n > 50_000 {
                return Err(DecodeError::section(sr.pos(), "too many locals"));
            }
            locals.extend(std::iter::repeat(ty).take(n));
        }

        let body_offset = sr.pos();
        let remaining = body_end
            .checked_sub(sr.r.pos())
            .ok_or(DecodeError::UnexpectedEof { offset: sr.pos() })?;
        let body = sr.r.read_bytes(remaining)?.to_vec();
        if body.last() != Some(&0x0B) {
            return Err(DecodeError::section(body_offset, "function body missing end opcode"));
        }
        module.codes.push(Code {
            locals,
            body,
            body_offset,
        });
    }
    Ok(())
}

fn decode_data_section(sr: &mut SectionReader, module: &mut Module) -> Result<(), DecodeError> {
    let count = sr.r.read_var_u32()? as usize;
    for _ in 0..count {
        let offset = sr.pos();
        let flags = sr.r.read_var_u32()?;
        let segment = match flags {
            0 => {
                let off = decode_const_expr(sr, module, ValType::I32)?;
                let len = sr.r.read_var_u32()? as usize;
                DataSegment {
                    mode: DataMode::Active { offset: off },
                    data: sr.r.read_bytes(len)?.to_vec(),
                }
            }
            1 => {
                let len = sr.r.read_var_u32()? as usize;
                DataSegment {
                    mode: DataMode::Passive,
                    data: sr.r.read_bytes(len)?.to_vec(),
                }
            }
            2 => {
                let mem = sr.r.read_var_u32()?;
                if mem != 0 {
                    return Err(DecodeError::IndexOutOfRange {
                        space: "memory",
                        index: mem,
                        offset,
                    });
                }
                let off = decode_const_expr(sr, module, ValType::I32)?;
                let len = sr.r.read_var_u32()? as usize;
                DataSegment {
                    mode: DataMode::Active { offset: off },
                    data: sr.r.read_bytes(len)?.to_vec(),
                }
            }
            _ => {
                return Err(DecodeError::section(
                    offset,
                    format!("invalid data segment flags {flags}"),
                ))
            }
        };
        if let DataMode::Active { .. } = segment.mode {
            if module.memories.is_empty() {
                return Err(DecodeError::section(offset, "active data segment without memory"));
            }
        }
        module.datas.push(segment);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leb(mut v: u32) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let byte = (v & 0x7F) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
        out
    }

    fn section(id: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![id];
        out.extend(leb(body.len() as u32));
        out.extend_from_slice(body);
        out
    }

    fn empty_module() -> Vec<u8> {
        let mut out = b"\0asm".to_vec();
        out.extend(1u32.to_le_bytes());
        out
    }

    #[test]
    fn test_bad_magic() {
        assert!(matches!(
            decode_module(b"\0owo\x01\0\0\0"),
            Err(DecodeError::BadMagic)
        ));
    }

    #[test]
    fn test_bad_version() {
        let mut m = b"\0asm".to_vec();
        m.extend(2u32.to_le_bytes());
        assert!(matches!(decode_module(&m), Err(DecodeError::BadVersion(2))));
    }

    #[test]
    fn test_empty_module() {
        let module = decode_module(&empty_module()).unwrap();
        assert!(module.types.is_empty());
        assert!(module.funcs.is_empty());
    }

    #[test]
    fn test_type_and_function_sections() {
        let mut m = empty_module();
        // (func (param i32 i32) (result i32))
        m.extend(section(1, &[0x01, 0x60, 0x02, 0x7F, 0x7F, 0x01, 0x7F]));
        m.extend(section(3, &[0x01, 0x00]));
        // One body: i32.const 0, end (locals: none).
        m.extend(section(10, &[0x01, 0x04, 0x00, 0x41, 0x00, 0x0B]));
        let module = decode_module(&m).unwrap();
        assert_eq!(module.types.len(), 1);
        assert_eq!(module.types[0].params.len(), 2);
        assert_eq!(module.funcs, vec![0]);
        assert_eq!(module.codes.len(), 1);
        assert_eq!(module.codes[0].body, vec![0x41, 0x00, 0x0B]);
    }

    #[test]
    fn test_body_offset_points_into_binary() {
        let mut m = empty_module();
        m.extend(section(1, &[0x01, 0x60, 0x00, 0x00]));
        m.extend(section(3, &[0x01, 0x00]));
        m.extend(section(10, &[0x01, 0x03, 0x00, 0x01, 0x0B]));
        let module = decode_module(&m).unwrap();
        let off = module.codes[0].body_offset;
        assert_eq!(&m[off..off + 2], &[0x01, 0x0B]);
    }

    #[test]
    fn test_section_out_of_order() {
        let mut m = empty_module();
        m.extend(section(3, &[0x00]));
        m.extend(section(1, &[0x00]));
        assert!(matches!(
            decode_module(&m),
            Err(DecodeError::SectionOutOfOrder { id: 1, .. })
        ));
    }

    #[test]
    fn test_custom_sections_skipped() {
        let mut m = empty_module();
        m.extend(section(0, &[0x04, b'n', b'a', b'm', b'e', 0xAA, 0xBB]));
        m.extend(section(1, &[0x00]));
        m.extend(section(0, &[0x01, b'x']));
        assert!(decode_module(&m).is_ok());
    }

    #[test]
    fn test_memory_section() {
        let mut m = empty_module();
        m.extend(section(5, &[0x01, 0x01, 0x01, 0x10]));
        let module = decode_module(&m).unwrap();
        assert_eq!(module.memories[0].limits.min, 1);
        assert_eq!(module.memories[0].limits.max, Some(16));
    }

    #[test]
    fn test_duplicate_export_rejected() {
        let mut m = empty_module();
        m.extend(section(5, &[0x01, 0x00, 0x01]));
        // Two exports both named "m".
        m.extend(section(
            7,
            &[0x02, 0x01, b'm', 0x02, 0x00, 0x01, b'm', 0x02, 0x00],
        ));
        assert!(matches!(
            decode_module(&m),
            Err(DecodeError::DuplicateExport(_))
        ));
    }

    #[test]
    fn test_global_import_rejected() {
        let mut m = empty_module();
        // import "env"."g" (global i32)
        m.extend(section(
            2,
            &[0x01, 0x03, b'e', b'n', b'v', 0x01, b'g', 0x03, 0x7F, 0x00],
        ));
        assert!(matches!(
            decode_module(&m),
            Err(DecodeError::UnknownImport { .. })
        ));
    }
}
