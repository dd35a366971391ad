use crate::{HashMap, HashSet};
use crate::error::AnalysisError;
use std::fmt;

use wasmparser::{
    BinaryReaderError, CompositeInnerType, KnownCustom, Naming, Operator, Parser, Payload, ValType,
};

use super::Value;
use super::operators::{Instruction, op_to_const, operator_text, translate_operator};
use super::parse_cfg::FuncCFG;
use super::{ControlInstruction, WFOperator};

pub(crate) struct FuncSpec {
    pub idx: u32,
    // unique identifier: name section, export name or `func{idx}`
    pub symbol: String,
    pub ty: wasmparser::FuncType,
    pub locals: Vec<ValType>,
    pub instructions: Vec<Instruction>,
    // `None` for imports
    pub cfg: Option<FuncCFG>,
    // `module::name` for imported functions
    pub import: Option<String>,
}

impl FuncSpec {
    pub(crate) fn is_import(&self) -> bool {
        self.import.is_some()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct GlobalSpec {
    pub ty: ValType,
    pub mutable: bool,
    // `None` for initializers we can't evaluate (imported or non-constant)
    pub init: Option<Value>,
}

pub(crate) struct ModuleSpec {
    pub filename: String,
    types: Vec<wasmparser::FuncType>,
    func_tyidxs: Vec<u32>,
    pub exported_funcs: HashMap<String, u32>,
    pub functions: Vec<FuncSpec>,
    pub memory_initializers: Vec<(Vec<u8>, usize)>,
    pub globals: Vec<GlobalSpec>,
    pub initial_mem_pages: usize,
    pub has_memory: bool,
}

impl fmt::Debug for ModuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleSpec")
            .field("filename", &self.filename)
            .field("functions", &self.functions.len())
            .finish_non_exhaustive()
    }
}

impl ModuleSpec {
    fn parse_types(module_binary: &[u8]) -> Result<Vec<wasmparser::FuncType>, AnalysisError> {
        let mut acc = Vec::new();
        for el in Parser::new(0).parse_all(module_binary) {
            if let Payload::TypeSection(types) = el? {
                for rec_group in types {
                    for type_ in rec_group?.types() {
                        match &type_.composite_type.inner {
                            CompositeInnerType::Func(func_ty) => acc.push(func_ty.clone()),
                            other => {
                                return Err(AnalysisError::MalformedModule(format!(
                                    "unsupported composite type {other:?}"
                                )));
                            }
                        }
                    }
                }
            }
        }
        Ok(acc)
    }

    fn parse_func_tyidxs(module_binary: &[u8]) -> Result<Vec<u32>, BinaryReaderError> {
        Parser::new(0)
            .parse_all(module_binary)
            .try_fold(Vec::new(), |mut acc, el| {
                if let Payload::FunctionSection(functions) = el? {
                    for function in functions {
                        acc.push(function?);
                    }
                }
                Ok(acc)
            })
    }

    fn parse_func_names(module_binary: &[u8]) -> Result<HashMap<u32, String>, BinaryReaderError> {
        Parser::new(0)
            .parse_all(module_binary)
            .try_fold(HashMap::default(), |mut acc, el| {
                if let Payload::CustomSection(reader) = el? {
                    let KnownCustom::Name(result) = reader.as_known() else {
                        return Ok(acc);
                    };
                    // a broken name section is not worth failing over
                    for el in result.into_iter().flatten() {
                        if let wasmparser::Name::Function(names) = el {
                            for Naming { index, name } in names.into_iter().flatten() {
                                let name = rustc_demangle::demangle(name).to_string();
                                acc.entry(index).or_insert(name);
                            }
                        }
                    }
                }
                Ok(acc)
            })
    }

    // (`module::name`, type index) of every imported function
    fn parse_imports(module_binary: &[u8]) -> Result<Vec<(String, u32)>, BinaryReaderError> {
        Parser::new(0)
            .parse_all(module_binary)
            .try_fold(Vec::new(), |mut acc, el| {
                if let Payload::ImportSection(imports) = el? {
                    for import in imports {
                        let import = import?;
                        if let wasmparser::TypeRef::Func(tyidx) = import.ty {
                            acc.push((format!("{}::{}", import.module, import.name), tyidx));
                        }
                    }
                }
                Ok(acc)
            })
    }

    fn func_ty(&self, idx: u32) -> Result<wasmparser::FuncType, AnalysisError> {
        self.func_tyidxs
            .get(idx as usize)
            .and_then(|tyidx| self.types.get(*tyidx as usize))
            .cloned()
            .ok_or_else(|| AnalysisError::MalformedModule(format!("no type for function {idx}")))
    }

    fn parse_func(
        &self,
        symbol: String,
        body: wasmparser::FunctionBody,
    ) -> Result<FuncSpec, AnalysisError> {
        let idx = self.functions.len() as u32;
        let cfg = FuncCFG::parse_func(&body)?;
        let mut func = FuncSpec {
            idx,
            symbol,
            ty: self.func_ty(idx)?,
            locals: Vec::new(),
            instructions: Vec::new(),
            cfg: None,
            import: None,
        };
        for elem in body.get_locals_reader()? {
            let (count, ty) = elem?;
            for _ in 0..count {
                func.locals.push(ty);
            }
        }

        for el in body.get_operators_reader()?.into_iter_with_offsets() {
            let (op, offset) = el?;
            let wfop = match op {
                Operator::Call { function_index } => {
                    WFOperator::Control(ControlInstruction::Call {
                        function_index,
                        function_ty: self.func_ty(function_index)?,
                    })
                }
                Operator::CallIndirect { type_index, .. } => {
                    let function_ty = self.types.get(type_index as usize).cloned().ok_or_else(
                        || AnalysisError::MalformedModule(format!("no type {type_index}")),
                    )?;
                    WFOperator::Control(ControlInstruction::CallIndirect { function_ty })
                }
                _ => translate_operator(&op),
            };
            func.instructions
                .push(Instruction::new(offset, wfop, operator_text(&op)));
        }
        func.cfg = Some(cfg);
        Ok(func)
    }

    fn const_expr(expr: &wasmparser::ConstExpr) -> Result<Option<Value>, BinaryReaderError> {
        let mut r = expr.get_operators_reader();
        let val = op_to_const(&r.read()?);
        if !matches!(r.read()?, Operator::End) {
            return Ok(None);
        }
        Ok(val)
    }

    pub(crate) fn parse(filename: &str, module_binary: &[u8]) -> Result<Self, AnalysisError> {
        let func_names = Self::parse_func_names(module_binary)?;
        let imports = Self::parse_imports(module_binary)?;
        let types = Self::parse_types(module_binary)?;

        let mut func_tyidxs: Vec<u32> = imports.iter().map(|(_, tyidx)| *tyidx).collect();
        func_tyidxs.extend(Self::parse_func_tyidxs(module_binary)?);

        let mut spec = Self {
            filename: filename.into(),
            types,
            func_tyidxs,
            exported_funcs: HashMap::default(),
            functions: Vec::new(),
            memory_initializers: Vec::new(),
            globals: Vec::new(),
            initial_mem_pages: 0,
            has_memory: false,
        };
        for (idx, (name, _)) in imports.into_iter().enumerate() {
            let idx = idx as u32;
            spec.functions.push(FuncSpec {
                idx,
                symbol: String::new(),
                ty: spec.func_ty(idx)?,
                locals: Vec::new(),
                instructions: Vec::new(),
                cfg: None,
                import: Some(name),
            });
        }

        let mut export_names = HashMap::<u32, String>::default();
        let mut saw_code = false;
        for payload in Parser::new(0).parse_all(module_binary) {
            match payload? {
                Payload::ImportSection(imports) => {
                    // imported globals come first in the global index space
                    for import in imports {
                        if let wasmparser::TypeRef::Global(ty) = import?.ty {
                            spec.globals.push(GlobalSpec {
                                ty: ty.content_type,
                                mutable: ty.mutable,
                                init: None,
                            });
                        }
                    }
                }
                Payload::CodeSectionStart { .. } => saw_code = true,
                Payload::CodeSectionEntry(body) => {
                    let func = spec.parse_func(String::new(), body)?;
                    spec.functions.push(func);
                }
                Payload::DataSection(datas) => {
                    for data in datas {
                        let data = data?;
                        match data.kind {
                            wasmparser::DataKind::Active {
                                memory_index: 0,
                                offset_expr,
                            } => {
                                let offset = Self::const_expr(&offset_expr)?
                                    .and_then(|v| v.as_i32())
                                    .ok_or_else(|| {
                                        AnalysisError::MalformedModule(
                                            "data segment offset is not an i32 constant".into(),
                                        )
                                    })?;
                                spec.memory_initializers
                                    .push((data.data.to_vec(), offset as u32 as usize));
                            }
                            // passive segments and secondary memories are ignored
                            _ => {}
                        }
                    }
                }
                Payload::ExportSection(exports) => {
                    for export in exports {
                        let export = export?;
                        if export.kind == wasmparser::ExternalKind::Func {
                            spec.exported_funcs
                                .insert(export.name.to_owned(), export.index);
                            export_names
                                .entry(export.index)
                                .or_insert_with(|| export.name.to_owned());
                        }
                    }
                }
                Payload::GlobalSection(globals) => {
                    for global in globals {
                        let global = global?;
                        spec.globals.push(GlobalSpec {
                            ty: global.ty.content_type,
                            mutable: global.ty.mutable,
                            init: Self::const_expr(&global.init_expr)?,
                        });
                    }
                }
                Payload::MemorySection(memories) => {
                    for memory in memories {
                        spec.initial_mem_pages = memory?.initial as usize;
                        spec.has_memory = true;
                    }
                }
                _ => {}
            }
        }
        if !saw_code {
            return Err(AnalysisError::MalformedModule(
                "module has no code section".into(),
            ));
        }

        // function identifiers, collisions get the index appended
        let mut seen = HashSet::<String>::default();
        for func in spec.functions.iter_mut() {
            let base = func_names
                .get(&func.idx)
                .or_else(|| export_names.get(&func.idx))
                .cloned()
                .unwrap_or_else(|| format!("func{}", func.idx));
            func.symbol = if seen.contains(&base) {
                format!("{base}#{}", func.idx)
            } else {
                base
            };
            seen.insert(func.symbol.clone());
        }
        Ok(spec)
    }

    pub(crate) fn function_by_symbol(&self, symbol: &str) -> Option<&FuncSpec> {
        self.functions.iter().find(|func| func.symbol == symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(wat: &str) -> Result<ModuleSpec, AnalysisError> {
        ModuleSpec::parse("test.wat", &wat::parse_str(wat).unwrap())
    }

    #[test]
    fn names_and_imports() {
        let spec = parse(
            r#"(module
                (import "wasi_snapshot_preview1" "proc_exit" (func (param i32)))
                (func $inner (result i32) i32.const 1)
                (func (export "run") (result i32) call $inner)
                (func (result i32) i32.const 2)
                (memory 2)
                (data (i32.const 16) "hi")
                (global (mut i32) (i32.const 7)))"#,
        )
        .unwrap();
        assert_eq!(spec.functions.len(), 4);
        assert_eq!(
            spec.functions[0].import.as_deref(),
            Some("wasi_snapshot_preview1::proc_exit")
        );
        assert_eq!(spec.functions[1].symbol, "inner");
        assert_eq!(spec.functions[2].symbol, "run");
        assert_eq!(spec.functions[3].symbol, "func3");
        assert_eq!(spec.exported_funcs["run"], 2);
        assert_eq!(spec.initial_mem_pages, 2);
        assert_eq!(spec.memory_initializers, vec![(b"hi".to_vec(), 16)]);
        assert_eq!(spec.globals[0].init, Some(Value::I32(7)));
        assert!(spec.globals[0].mutable);
        assert!(spec.function_by_symbol("run").is_some());
    }

    #[test]
    fn instruction_offsets_and_text() {
        let spec = parse("(module (func (param i32) (result i32) local.get 0 i32.eqz))").unwrap();
        let insns = &spec.functions[0].instructions;
        assert_eq!(insns.len(), 3);
        assert_eq!(insns[0].text, "local.get 0");
        assert_eq!(insns[1].text, "i32.eqz");
        assert!(insns[0].offset < insns[1].offset);
    }

    #[test]
    fn missing_code_section_is_malformed() {
        let err = parse("(module (memory 1))").unwrap_err();
        assert!(matches!(err, AnalysisError::MalformedModule(_)));
    }
}
