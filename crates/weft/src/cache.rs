//! The per-code-object translation cache.
//!
//! Each host code object maps to a getter (`Lookup` or `Skip`) and an
//! ordered chain of `(rewritten code, guard)` entries. A frame either
//! hits an entry whose guard holds, extends the chain with a fresh
//! translation, or, once a code object has proven untranslatable, is
//! skipped for good.

use std::rc::Rc;

use ahash::AHashMap;
use tracing::debug;

use crate::{
    bytecode::CodeObject,
    engine::{SimFrame, TranslateDeps},
    error::{ExecError, ExecResult},
    executor::OpcodeExecutor,
    graph::FunctionGraph,
    guard::Guard,
    host::Frame,
};

/// Rewritten code handed back to the frame-evaluation hook.
#[derive(Debug, Clone)]
pub struct CustomCode {
    pub code: Rc<CodeObject>,
    pub disable_eval_frame: bool,
}

/// How a cached code object answers future calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheGetter {
    /// Walk the guard chain; translate again on a full miss.
    Lookup,
    /// This code is untranslatable; always fall back to the host.
    Skip,
}

type GuardedCode = (Rc<CodeObject>, Guard);

#[derive(Debug)]
struct CacheSlot {
    getter: CacheGetter,
    entries: Vec<GuardedCode>,
    /// Pins the original code object so its identity (the cache key)
    /// cannot be recycled while the entry lives.
    #[expect(dead_code, reason = "held for its ownership, never read")]
    original: Rc<CodeObject>,
}

/// Keys host code objects by identity, not content.
fn code_key(code: &Rc<CodeObject>) -> usize {
    Rc::as_ptr(code) as usize
}

/// The translation cache.
#[derive(Debug, Default)]
pub struct InstructionTranslatorCache {
    cache: AHashMap<usize, CacheSlot>,
    /// Number of translation attempts, for tests.
    pub translate_count: usize,
}

impl InstructionTranslatorCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every entry and resets counters. For tests.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.translate_count = 0;
    }

    /// The hook body: answer from the cache or translate the frame.
    pub fn lookup_or_translate(
        &mut self,
        frame: &Frame,
        deps: &mut TranslateDeps<'_>,
    ) -> ExecResult<Option<CustomCode>> {
        let key = code_key(&frame.code);
        if !self.cache.contains_key(&key) {
            debug!(code = %frame.code.name, "cache miss");
            return self.translate(frame, deps);
        }
        match self.cache[&key].getter {
            CacheGetter::Skip => {
                debug!(code = %frame.code.name, "skip frame");
                Ok(None)
            }
            CacheGetter::Lookup => self.lookup(frame, deps),
        }
    }

    /// Walks the guard chain; first holding guard wins.
    fn lookup(&mut self, frame: &Frame, deps: &mut TranslateDeps<'_>) -> ExecResult<Option<CustomCode>> {
        let key = code_key(&frame.code);
        for (code, guard) in &self.cache[&key].entries {
            match guard.evaluate(frame) {
                Ok(true) => {
                    debug!(code = %frame.code.name, "cache hit");
                    return Ok(Some(CustomCode {
                        code: Rc::clone(code),
                        disable_eval_frame: false,
                    }));
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(code = %frame.code.name, error = %e, "guard evaluation error");
                }
            }
        }
        // Full miss: translate again and extend the chain.
        self.translate(frame, deps)
    }

    /// Translates the frame, records the entry, and returns the result.
    fn translate(&mut self, frame: &Frame, deps: &mut TranslateDeps<'_>) -> ExecResult<Option<CustomCode>> {
        let key = code_key(&frame.code);
        self.translate_count += 1;
        match start_translate(frame, deps)? {
            Some((code, guard)) => {
                let slot = self.cache.entry(key).or_insert_with(|| CacheSlot {
                    getter: CacheGetter::Lookup,
                    entries: Vec::new(),
                    original: Rc::clone(&frame.code),
                });
                slot.getter = CacheGetter::Lookup;
                slot.entries.push((Rc::clone(&code), guard));
                Ok(Some(CustomCode {
                    code,
                    disable_eval_frame: false,
                }))
            }
            None => {
                self.cache.insert(
                    key,
                    CacheSlot {
                        getter: CacheGetter::Skip,
                        entries: Vec::new(),
                        original: Rc::clone(&frame.code),
                    },
                );
                Ok(None)
            }
        }
    }
}

/// Runs one translation attempt over a frame.
///
/// NotImplemented and a leaked graph-break fall back to the
/// dummy-variable replacement (original code, always-true guard) unless
/// strict mode re-raises them; anything else is wrapped as an inner error
/// carrying the simulated-stack summary.
pub fn start_translate(frame: &Frame, deps: &mut TranslateDeps<'_>) -> ExecResult<Option<GuardedCode>> {
    let mut graph = FunctionGraph::new(&format!("#{}_compiled", frame.code.name));
    graph.codegen.set_frame(frame);

    let result = OpcodeExecutor::run_top_level(&mut graph, frame, deps);
    match result {
        Ok(guarded) => Ok(Some(guarded)),
        Err(err) if err.is_fallback() => {
            if deps.config.strict_mode {
                return Err(err);
            }
            debug!(code = %frame.code.name, error = %err, "unsupported frame, falling back");
            match graph.codegen.replace_dummy_variable() {
                Ok(fallback) => Ok(Some(fallback)),
                Err(_) => Ok(None),
            }
        }
        Err(ExecError::Inner(msg)) => Err(ExecError::Inner(error_message_summary(&msg, deps.sim_stack))),
        Err(other) => Err(other),
    }
}

/// One source line per live simulator, oldest first.
fn error_message_summary(message: &str, sim_stack: &[SimFrame]) -> String {
    let mut lines = vec!["in simulated execution:".to_string()];
    for frame in sim_stack {
        lines.push(format!("  {frame}"));
    }
    lines.push(format!("  {message}"));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_key_is_identity() {
        let code = Rc::new(CodeObject {
            name: "f".to_string(),
            instructions: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            argcount: 0,
            has_varargs: false,
            has_varkw: false,
            first_line: 1,
        });
        let clone = Rc::new((*code).clone());
        assert_eq!(code_key(&code), code_key(&Rc::clone(&code)));
        assert_ne!(code_key(&code), code_key(&clone));
    }

    #[test]
    fn test_error_message_summary_lists_frames() {
        let stack = vec![
            SimFrame {
                name: "f".to_string(),
                line: 3,
            },
            SimFrame {
                name: "g".to_string(),
                line: 7,
            },
        ];
        let summary = error_message_summary("stack underflow", &stack);
        assert!(summary.contains("f (line 3)"));
        assert!(summary.contains("g (line 7)"));
        assert!(summary.ends_with("stack underflow"));
    }
}
