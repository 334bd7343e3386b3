//! Script verification pool.
//!
//! Block application hands every input's script check to a [`VerifyBatch`]
//! and keeps walking the block while the checks run. [`VerifyPool::run`]
//! returns only after every submitted check has finished, so the caller
//! sees a single failure count per block. Checks cannot be cancelled once
//! submitted; an early return from the batch body still waits for them.
//!
//! The inline pool runs each check on the submitting thread, which makes
//! failure order deterministic for tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use quarry_core::error::ChainError;
use quarry_core::traits::SignatureVerifier;
use quarry_core::types::Transaction;

/// One input's script check.
#[derive(Debug, Clone)]
pub struct ScriptCheck<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    /// Locking script of the output being spent.
    pub pk_script: Vec<u8>,
    pub value: u64,
    pub flags: u32,
}

impl ScriptCheck<'_> {
    pub fn run(&self, verifier: &dyn SignatureVerifier) -> bool {
        let Some(input) = self.tx.inputs.get(self.input_index) else {
            return false;
        };
        verifier.verify(
            &input.script_sig,
            &self.pk_script,
            self.input_index,
            self.tx,
            self.value,
            self.flags,
        )
    }
}

#[derive(Debug, Clone)]
enum Mode {
    Inline,
    Threads(Arc<rayon::ThreadPool>),
}

/// Runs script checks inline or on a dedicated thread pool.
#[derive(Debug, Clone)]
pub struct VerifyPool {
    mode: Mode,
}

impl VerifyPool {
    pub fn inline() -> Self {
        Self { mode: Mode::Inline }
    }

    /// A pool with `threads` workers; zero means inline.
    pub fn new(threads: usize) -> Result<Self, ChainError> {
        if threads == 0 {
            return Ok(Self::inline());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("verify-{i}"))
            .build()
            .map_err(|e| ChainError::Pool(e.to_string()))?;
        Ok(Self { mode: Mode::Threads(Arc::new(pool)) })
    }

    pub fn threads(&self) -> usize {
        match &self.mode {
            Mode::Inline => 0,
            Mode::Threads(pool) => pool.current_num_threads(),
        }
    }

    /// Run `body` with a batch to submit checks to, then wait for all of
    /// them. Returns the body's result and the number of failed checks.
    pub fn run<'scope, R>(
        &self,
        verifier: &'scope dyn SignatureVerifier,
        body: impl FnOnce(&VerifyBatch<'_, 'scope>) -> R,
    ) -> (R, u32) {
        let failures = Arc::new(AtomicU32::new(0));
        let result = match &self.mode {
            Mode::Inline => body(&VerifyBatch {
                scope: None,
                verifier,
                failures: failures.clone(),
            }),
            Mode::Threads(pool) => pool.in_place_scope(|scope| {
                body(&VerifyBatch {
                    scope: Some(scope),
                    verifier,
                    failures: failures.clone(),
                })
            }),
        };
        (result, failures.load(Ordering::Acquire))
    }
}

/// Join barrier for one block's checks.
pub struct VerifyBatch<'s, 'scope> {
    scope: Option<&'s rayon::Scope<'scope>>,
    verifier: &'scope dyn SignatureVerifier,
    failures: Arc<AtomicU32>,
}

impl<'scope> VerifyBatch<'_, 'scope> {
    pub fn submit(&self, check: ScriptCheck<'scope>) {
        match self.scope {
            None => {
                if !check.run(self.verifier) {
                    self.failures.fetch_add(1, Ordering::AcqRel);
                }
            }
            Some(scope) => {
                let verifier = self.verifier;
                let failures = self.failures.clone();
                scope.spawn(move |_| {
                    if !check.run(verifier) {
                        failures.fetch_add(1, Ordering::AcqRel);
                    }
                });
            }
        }
    }

    /// Failures reported so far. Final only after the batch has been joined.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }
}
