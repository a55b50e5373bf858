//! Module compilation with caching.
//!
//! Transpiled sources are cached by the SHA-1 of `(module type, payload)` without eviction;
//! compiled programs are cached per `"{module}/{namespace}"` and reused while the payload
//! digest is unchanged.
use std::{collections::HashMap, sync::Arc};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use parking_lot::RwLock;
use sha1::{Digest, Sha1};

use super::{runtime::CompiledModule, transpile::transpile};
use crate::{
    core::resources::{Module, ModuleType, NamespacedResource},
    ports::scripting::{ScriptError, ScriptResult},
};

#[derive(Debug, Default)]
pub struct ModuleCompiler {
    transpiled: RwLock<HashMap<String, Arc<str>>>,
    programs: RwLock<HashMap<String, CompiledModule>>,
}

fn digest(module: &Module) -> String {
    let mut hasher = Sha1::new();
    hasher.update(match module.module_type {
        ModuleType::Javascript => b"js:".as_slice(),
        ModuleType::Typescript => b"ts:".as_slice(),
    });
    hasher.update(module.payload.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

impl ModuleCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile(&self, module: &Module) -> ScriptResult<CompiledModule> {
        let key = module.key();
        let digest = digest(module);
        if let Some(cached) = self.programs.read().get(&key)
            && cached.digest == digest
        {
            return Ok(cached.clone());
        }

        let cached_code = self.transpiled.read().get(&digest).cloned();
        let code = match cached_code {
            Some(code) => code,
            None => {
                let raw = STANDARD
                    .decode(module.payload.trim())
                    .map_err(|e| ScriptError::Transpile(format!("invalid base64 payload: {e}")))?;
                let source = String::from_utf8(raw)
                    .map_err(|_| ScriptError::Transpile("payload is not valid UTF-8".into()))?;
                let code: Arc<str> = transpile(&source, module.module_type)?.into();
                self.transpiled
                    .write()
                    .insert(digest.clone(), code.clone());
                code
            }
        };

        let compiled = CompiledModule {
            name: module.name.clone(),
            namespace: module.namespace.clone(),
            digest,
            code,
        };
        self.programs.write().insert(key, compiled.clone());
        Ok(compiled)
    }

    /// Compile a route's modules, ordered by module name.
    pub fn compile_all(&self, modules: &[Module]) -> Result<Arc<[CompiledModule]>, (String, ScriptError)> {
        let mut sorted: Vec<&Module> = modules.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        sorted
            .into_iter()
            .map(|m| self.compile(m).map_err(|e| (m.name.clone(), e)))
            .collect::<Result<Vec<_>, _>>()
            .map(Arc::from)
    }

    pub fn cached_sources(&self) -> usize {
        self.transpiled.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(name: &str, source: &str, module_type: ModuleType) -> Module {
        Module {
            name: name.into(),
            namespace: "ns".into(),
            payload: STANDARD.encode(source),
            module_type,
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_compile_caches_by_payload() {
        let compiler = ModuleCompiler::new();
        let a = module("a", "export const x = 1;", ModuleType::Javascript);
        let first = compiler.compile(&a).unwrap();
        assert_eq!(&*first.code, "const x = 1;\nexports.x = x;");

        // same payload under another name shares the transpiled source
        let b = module("b", "export const x = 1;", ModuleType::Javascript);
        let second = compiler.compile(&b).unwrap();
        assert!(Arc::ptr_eq(&first.code, &second.code));
        assert_eq!(compiler.cached_sources(), 1);

        let ts = module("a", "export const x: number = 1;", ModuleType::Typescript);
        let third = compiler.compile(&ts).unwrap();
        assert_ne!(third.digest, first.digest);
        assert_eq!(&*third.code, "const x = 1;\nexports.x = x;");
    }

    #[test]
    fn test_compile_all_sorts_and_names_failures() {
        let compiler = ModuleCompiler::new();
        let modules = vec![
            module("zeta", "const z = 1;", ModuleType::Javascript),
            module("alpha", "const a = 1;", ModuleType::Javascript),
        ];
        let compiled = compiler.compile_all(&modules).unwrap();
        let names: Vec<_> = compiled.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["alpha", "zeta"]);

        let bad = vec![module("bad", "import x from 'net';", ModuleType::Javascript)];
        let (name, err) = compiler.compile_all(&bad).unwrap_err();
        assert_eq!(name, "bad");
        assert_eq!(err, ScriptError::UnsupportedImport("net".into()));

        let mut garbage = module("g", "", ModuleType::Javascript);
        garbage.payload = "%%%".into();
        assert!(matches!(
            compiler.compile(&garbage).unwrap_err(),
            ScriptError::Transpile(_)
        ));
    }
}
