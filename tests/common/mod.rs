//! A tiny Wasm binary builder for the end-to-end tests.

pub fn leb_u32(mut v: u32) -> Vec<u8> {
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

pub fn leb_i32(v: i32) -> Vec<u8> {
    let mut out = Vec::new();
    let mut v = v as i64;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        let done = (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

struct FuncDef {
    type_idx: u32,
    locals: Vec<(u32, u8)>,
    body: Vec<u8>,
}

/// Builds a module binary section by section.
#[derive(Default)]
pub struct WasmBuilder {
    types: Vec<Vec<u8>>,
    imports: Vec<Vec<u8>>,
    num_imported_funcs: u32,
    funcs: Vec<FuncDef>,
    memory: Option<(u32, Option<u32>)>,
    tables: Vec<(u32, Option<u32>)>,
    exports: Vec<Vec<u8>>,
    elems: Vec<Vec<u8>>,
    datas: Vec<Vec<u8>>,
}

impl WasmBuilder {
    pub fn new() -> WasmBuilder {
        WasmBuilder::default()
    }

    /// Add a function type; 0x7F = i32, 0x7E = i64, 0x7D = f32, 0x7C = f64.
    pub fn add_type(&mut self, params: &[u8], results: &[u8]) -> u32 {
        let mut ty = vec![0x60];
        ty.extend(leb_u32(params.len() as u32));
        ty.extend_from_slice(params);
        ty.extend(leb_u32(results.len() as u32));
        ty.extend_from_slice(results);
        self.types.push(ty);
        (self.types.len() - 1) as u32
    }

    /// Import a function; imports precede local functions in index space.
    pub fn import_func(&mut self, module: &str, name: &str, type_idx: u32) -> u32 {
        let mut imp = leb_u32(module.len() as u32);
        imp.extend_from_slice(module.as_bytes());
        imp.extend(leb_u32(name.len() as u32));
        imp.extend_from_slice(name.as_bytes());
        imp.push(0x00);
        imp.extend(leb_u32(type_idx));
        self.imports.push(imp);
        self.num_imported_funcs += 1;
        self.num_imported_funcs - 1
    }

    /// Add a function body (without the trailing end; it is appended).
    /// `locals` are (count, valtype byte) runs.
    pub fn add_func(&mut self, type_idx: u32, locals: &[(u32, u8)], body: &[u8]) -> u32 {
        let mut full = body.to_vec();
        full.push(0x0B);
        self.funcs.push(FuncDef {
            type_idx,
            locals: locals.to_vec(),
            body: full,
        });
        self.num_imported_funcs + (self.funcs.len() - 1) as u32
    }

    pub fn set_memory(&mut self, min: u32, max: Option<u32>) {
        self.memory = Some((min, max));
    }

    pub fn add_table(&mut self, min: u32, max: Option<u32>) -> u32 {
        self.tables.push((min, max));
        (self.tables.len() - 1) as u32
    }

    pub fn export_func(&mut self, name: &str, func_idx: u32) {
        let mut e = leb_u32(name.len() as u32);
        e.extend_from_slice(name.as_bytes());
        e.push(0x00);
        e.extend(leb_u32(func_idx));
        self.exports.push(e);
    }

    pub fn export_memory(&mut self, name: &str) {
        let mut e = leb_u32(name.len() as u32);
        e.extend_from_slice(name.as_bytes());
        e.push(0x02);
        e.extend(leb_u32(0));
        self.exports.push(e);
    }

    /// Active element segment on table 0.
    pub fn add_active_elem(&mut self, offset: i32, funcs: &[u32]) {
        let mut seg = vec![0x00, 0x41];
        seg.extend(leb_i32(offset));
        seg.push(0x0B);
        seg.extend(leb_u32(funcs.len() as u32));
        for f in funcs {
            seg.extend(leb_u32(*f));
        }
        self.elems.push(seg);
    }

    /// Active data segment at a constant offset.
    pub fn add_active_data(&mut self, offset: i32, data: &[u8]) {
        let mut seg = vec![0x00, 0x41];
        seg.extend(leb_i32(offset));
        seg.push(0x0B);
        seg.extend(leb_u32(data.len() as u32));
        seg.extend_from_slice(data);
        self.datas.push(seg);
    }

    fn section(id: u8, body: Vec<u8>) -> Vec<u8> {
        let mut out = vec![id];
        out.extend(leb_u32(body.len() as u32));
        out.extend(body);
        out
    }

    fn vec_section(id: u8, items: &[Vec<u8>]) -> Vec<u8> {
        let mut body = leb_u32(items.len() as u32);
        for item in items {
            body.extend_from_slice(item);
        }
        Self::section(id, body)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = b"\0asm".to_vec();
        out.extend(1u32.to_le_bytes());

        if !self.types.is_empty() {
            out.extend(Self::vec_section(1, &self.types));
        }
        if !self.imports.is_empty() {
            out.extend(Self::vec_section(2, &self.imports));
        }
        if !self.funcs.is_empty() {
            let items: Vec<Vec<u8>> =
                self.funcs.iter().map(|f| leb_u32(f.type_idx)).collect();
            out.extend(Self::vec_section(3, &items));
        }
        if !self.tables.is_empty() {
            let items: Vec<Vec<u8>> = self
                .tables
                .iter()
                .map(|(min, max)| {
                    let mut t = vec![0x70];
                    match max {
                        Some(max) => {
                            t.push(0x01);
                            t.extend(leb_u32(*min));
                            t.extend(leb_u32(*max));
                        }
                        None => {
                            t.push(0x00);
                            t.extend(leb_u32(*min));
                        }
                    }
                    t
                })
                .collect();
            out.extend(Self::vec_section(4, &items));
        }
        if let Some((min, max)) = self.memory {
            let mut m = Vec::new();
            match max {
                Some(max) => {
                    m.push(0x01);
                    m.extend(leb_u32(min));
                    m.extend(leb_u32(max));
                }
                None => {
                    m.push(0x00);
                    m.extend(leb_u32(min));
                }
            }
            out.extend(Self::vec_section(5, &[m]));
        }
        if !self.exports.is_empty() {
            out.extend(Self::vec_section(7, &self.exports));
        }
        if !self.elems.is_empty() {
            out.extend(Self::vec_section(9, &self.elems));
        }
        if !self.funcs.is_empty() {
            let items: Vec<Vec<u8>> = self
                .funcs
                .iter()
                .map(|f| {
                    let mut code = leb_u32(f.locals.len() as u32);
                    for (count, ty) in &f.locals {
                        code.extend(leb_u32(*count));
                        code.push(*ty);
                    }
                    code.extend_from_slice(&f.body);
                    let mut item = leb_u32(code.len() as u32);
                    item.extend(code);
                    item
                })
                .collect();
            out.extend(Self::vec_section(10, &items));
        }
        if !self.datas.is_empty() {
            out.extend(Self::vec_section(11, &self.datas));
        }
        out
    }
}
