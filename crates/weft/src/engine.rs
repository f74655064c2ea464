//! The engine handle.
//!
//! The process-wide singletons (translation cache, meta cache,
//! variable creator, segment table) live here as fields of an explicit
//! [`JitEngine`] value: no hidden globals, `new` at construction and
//! `clear` for test teardown. A translation attempt borrows the engine's
//! collaborators through [`TranslateDeps`].

use crate::{
    cache::{CustomCode, InstructionTranslatorCache},
    config::Config,
    error::ExecResult,
    graph::SegmentTable,
    host::Frame,
    meta::MetaCache,
    variables::VariableFactory,
};

/// One line of the simulated call stack, for error summaries.
#[derive(Debug, Clone)]
pub struct SimFrame {
    pub name: String,
    pub line: u32,
}

impl std::fmt::Display for SimFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (line {})", self.name, self.line)
    }
}

/// Borrowed collaborators threaded through one translation attempt.
pub struct TranslateDeps<'a> {
    pub meta: &'a mut MetaCache,
    pub segments: &'a mut SegmentTable,
    pub config: &'a Config,
    pub factory: &'a VariableFactory,
    /// Live simulator frames; left populated on failure so the
    /// translation boundary can render a stack summary.
    pub sim_stack: &'a mut Vec<SimFrame>,
}

/// Process-wide translator state.
#[derive(Debug)]
pub struct JitEngine {
    pub cache: InstructionTranslatorCache,
    pub meta: MetaCache,
    pub segments: SegmentTable,
    pub factory: VariableFactory,
    pub config: Config,
}

impl JitEngine {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            cache: InstructionTranslatorCache::new(),
            meta: MetaCache::new(),
            segments: SegmentTable::new(),
            factory: VariableFactory::new(),
            config,
        }
    }

    /// The frame-evaluation hook: returns rewritten code to run instead
    /// of the frame's own, or `None` to fall back to default evaluation.
    pub fn hook(&mut self, frame: &Frame) -> ExecResult<Option<CustomCode>> {
        let mut sim_stack = Vec::new();
        let mut deps = TranslateDeps {
            meta: &mut self.meta,
            segments: &mut self.segments,
            config: &self.config,
            factory: &self.factory,
            sim_stack: &mut sim_stack,
        };
        self.cache.lookup_or_translate(frame, &mut deps)
    }

    /// Resets every cache. For tests.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.meta.clear();
        self.segments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_resets_collaborators() {
        let mut engine = JitEngine::new(Config::default());
        engine.segments.register(crate::graph::Segment {
            statements: Vec::new(),
            inputs: Vec::new(),
            input_metas: Vec::new(),
            outputs: Vec::new(),
        });
        assert_eq!(engine.segments.len(), 1);
        engine.clear();
        assert!(engine.segments.is_empty());
        assert_eq!(engine.cache.translate_count, 0);
    }
}
