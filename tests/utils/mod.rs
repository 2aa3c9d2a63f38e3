// Shared helpers for integration tests
//
// Hand-assembles minimal WASM binaries: imported and defined i32 globals,
// global exports and a `name` section. Nothing here is executable; the
// modules only need to decode.

#![allow(dead_code)]

use rastreo::symbols::{VERSION_MAJOR_GLOBAL, VERSION_MINOR_GLOBAL};

const MAGIC_AND_VERSION: [u8; 8] = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

const SECTION_CUSTOM: u8 = 0;
const SECTION_IMPORT: u8 = 2;
const SECTION_GLOBAL: u8 = 6;
const SECTION_EXPORT: u8 = 7;

const KIND_GLOBAL: u8 = 0x03;
const VALTYPE_I32: u8 = 0x7f;
const OP_I32_CONST: u8 = 0x41;
const OP_GLOBAL_GET: u8 = 0x23;
const OP_END: u8 = 0x0b;

fn uleb(mut value: u32, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn sleb(mut value: i64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn string(s: &str, out: &mut Vec<u8>) {
    uleb(s.len() as u32, out);
    out.extend_from_slice(s.as_bytes());
}

fn section(id: u8, body: &[u8], out: &mut Vec<u8>) {
    out.push(id);
    uleb(body.len() as u32, out);
    out.extend_from_slice(body);
}

#[derive(Debug, Clone)]
enum GlobalInit {
    I32(i32),
    /// Non-constant initializer (`global.get 0`)
    FromImport,
}

/// Builder for test modules
#[derive(Debug, Clone, Default)]
pub struct ModuleBuilder {
    imported_globals: Vec<String>,
    globals: Vec<GlobalInit>,
    exports: Vec<(String, u32)>,
    names: Option<Vec<(u32, String)>>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Import an immutable i32 global from `env`
    pub fn import_global(mut self, field: &str) -> Self {
        self.imported_globals.push(field.to_string());
        self
    }

    /// Define an i32 global; returns its index in the global index space
    pub fn global(&mut self, value: i32) -> u32 {
        self.globals.push(GlobalInit::I32(value));
        (self.imported_globals.len() + self.globals.len() - 1) as u32
    }

    /// Define a global initialized from imported global 0
    pub fn derived_global(&mut self) -> u32 {
        self.globals.push(GlobalInit::FromImport);
        (self.imported_globals.len() + self.globals.len() - 1) as u32
    }

    pub fn export_global(mut self, name: &str, index: u32) -> Self {
        self.exports.push((name.to_string(), index));
        self
    }

    /// Declare and export both version globals
    pub fn version(mut self, major: i32, minor: i32) -> Self {
        let major_index = self.global(major);
        let minor_index = self.global(minor);
        self.export_global(VERSION_MAJOR_GLOBAL, major_index)
            .export_global(VERSION_MINOR_GLOBAL, minor_index)
    }

    pub fn function_name(mut self, index: u32, name: &str) -> Self {
        self.names
            .get_or_insert_with(Vec::new)
            .push((index, name.to_string()));
        self
    }

    /// Emit an empty `name` section (no function names)
    pub fn empty_names(mut self) -> Self {
        self.names.get_or_insert_with(Vec::new);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = MAGIC_AND_VERSION.to_vec();

        if !self.imported_globals.is_empty() {
            let mut body = Vec::new();
            uleb(self.imported_globals.len() as u32, &mut body);
            for field in &self.imported_globals {
                string("env", &mut body);
                string(field, &mut body);
                body.extend_from_slice(&[KIND_GLOBAL, VALTYPE_I32, 0x00]);
            }
            section(SECTION_IMPORT, &body, &mut out);
        }

        if !self.globals.is_empty() {
            let mut body = Vec::new();
            uleb(self.globals.len() as u32, &mut body);
            for init in &self.globals {
                body.extend_from_slice(&[VALTYPE_I32, 0x00]);
                match init {
                    GlobalInit::I32(value) => {
                        body.push(OP_I32_CONST);
                        sleb(*value as i64, &mut body);
                    }
                    GlobalInit::FromImport => {
                        body.push(OP_GLOBAL_GET);
                        uleb(0, &mut body);
                    }
                }
                body.push(OP_END);
            }
            section(SECTION_GLOBAL, &body, &mut out);
        }

        if !self.exports.is_empty() {
            let mut body = Vec::new();
            uleb(self.exports.len() as u32, &mut body);
            for (name, index) in &self.exports {
                string(name, &mut body);
                body.push(KIND_GLOBAL);
                uleb(*index, &mut body);
            }
            section(SECTION_EXPORT, &body, &mut out);
        }

        if let Some(names) = &self.names {
            let mut map = Vec::new();
            uleb(names.len() as u32, &mut map);
            for (index, name) in names {
                uleb(*index, &mut map);
                string(name, &mut map);
            }

            let mut body = Vec::new();
            string("name", &mut body);
            body.push(0x01); // function names subsection
            uleb(map.len() as u32, &mut body);
            body.extend_from_slice(&map);
            section(SECTION_CUSTOM, &body, &mut out);
        }

        out
    }
}

/// Compatible 0.0 module naming `main`, `parse` and a mangled Rust function
pub fn instrumented_module() -> Vec<u8> {
    ModuleBuilder::new()
        .version(0, 0)
        .function_name(0, "main")
        .function_name(1, "parse")
        .function_name(2, "_ZN4core3fmt5write17h0123456789abcdefE")
        .build()
}
