//! Candidate producers.
//!
//! A `CandidateSource` is a pull-based, possibly unbounded stream of
//! candidates. `None` marks the end of the sequence; the orchestrator stops
//! pulling once it sees it or once a stop is requested.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use alpha_state::{Candidate, SimulationSettings};
use regex::Regex;
use tracing::warn;

use crate::error::Result;
use crate::validator::Validator;

/// Pull-based producer of candidates.
pub trait CandidateSource: Send {
    /// Next candidate, or `None` once the sequence is exhausted.
    fn next_candidate(&mut self) -> Option<Candidate>;
}

impl<S: CandidateSource + ?Sized> CandidateSource for Box<S> {
    fn next_candidate(&mut self) -> Option<Candidate> {
        (**self).next_candidate()
    }
}

/// Adapts any iterator of candidates.
pub struct IterSource<I> {
    inner: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Candidate> + Send,
{
    pub fn new(inner: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            inner: inner.into_iter(),
        }
    }
}

impl<I> CandidateSource for IterSource<I>
where
    I: Iterator<Item = Candidate> + Send,
{
    fn next_candidate(&mut self) -> Option<Candidate> {
        self.inner.next()
    }
}

/// One expression per line. Blank lines and `#` comments are skipped; every
/// expression shares the same settings and strategy tag.
pub struct ExpressionFileSource<R> {
    lines: std::io::Lines<R>,
    settings: SimulationSettings,
    strategy_tag: String,
}

impl ExpressionFileSource<BufReader<File>> {
    pub fn open(
        path: impl AsRef<Path>,
        settings: SimulationSettings,
        strategy_tag: impl Into<String>,
    ) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::from_reader(BufReader::new(file), settings, strategy_tag))
    }
}

impl<R: BufRead> ExpressionFileSource<R> {
    pub fn from_reader(
        reader: R,
        settings: SimulationSettings,
        strategy_tag: impl Into<String>,
    ) -> Self {
        Self {
            lines: reader.lines(),
            settings,
            strategy_tag: strategy_tag.into(),
        }
    }
}

impl<R: BufRead + Send> CandidateSource for ExpressionFileSource<R> {
    fn next_candidate(&mut self) -> Option<Candidate> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "stopped reading expression file");
                    return None;
                }
            };
            let expr = line.trim();
            if expr.is_empty() || expr.starts_with('#') {
                continue;
            }
            return Some(Candidate::new(
                expr,
                self.settings.clone(),
                self.strategy_tag.clone(),
            ));
        }
    }
}

/// Variants of one base expression with each integer window argument
/// replaced, one at a time, by every value in a list.
///
/// A window argument is an integer literal passed as the last argument of a
/// `ts_*` operator, as in `ts_mean(close, 10)`. Other constants such as the
/// `2` in `close / 2` or `power(x, 2)` are left alone.
///
/// The base expression itself is yielded first. Variants equal to the base
/// are skipped.
pub struct ParameterSweepSource {
    base: String,
    /// Byte ranges of integer arguments in `base`.
    params: Vec<(usize, usize)>,
    values: Vec<u32>,
    settings: SimulationSettings,
    strategy_tag: String,
    emitted_base: bool,
    param_idx: usize,
    value_idx: usize,
}

impl ParameterSweepSource {
    pub fn new(
        base: impl Into<String>,
        values: Vec<u32>,
        settings: SimulationSettings,
        strategy_tag: impl Into<String>,
    ) -> Result<Self> {
        let base = base.into().trim().to_string();
        let pattern = Regex::new(r",\s*(\d+)\s*\)")?;
        let params = pattern
            .captures_iter(&base)
            .filter_map(|c| c.get(1))
            .filter(|m| enclosing_call(&base, m.start()).is_some_and(|name| name.starts_with("ts_")))
            .map(|m| (m.start(), m.end()))
            .collect();
        Ok(Self {
            base,
            params,
            values,
            settings,
            strategy_tag: strategy_tag.into(),
            emitted_base: false,
            param_idx: 0,
            value_idx: 0,
        })
    }

    /// Number of integer arguments found in the base expression.
    pub fn parameter_count(&self) -> usize {
        self.params.len()
    }

    fn candidate(&self, expression: String) -> Candidate {
        Candidate::new(expression, self.settings.clone(), self.strategy_tag.clone())
    }
}

impl CandidateSource for ParameterSweepSource {
    fn next_candidate(&mut self) -> Option<Candidate> {
        if !self.emitted_base {
            self.emitted_base = true;
            return Some(self.candidate(self.base.clone()));
        }
        while self.param_idx < self.params.len() {
            if self.value_idx >= self.values.len() {
                self.param_idx += 1;
                self.value_idx = 0;
                continue;
            }
            let (start, end) = self.params[self.param_idx];
            let value = self.values[self.value_idx].to_string();
            self.value_idx += 1;
            if self.base[start..end] == value {
                continue;
            }
            let variant = format!("{}{}{}", &self.base[..start], value, &self.base[end..]);
            return Some(self.candidate(variant));
        }
        None
    }
}

/// Name of the call whose argument list contains byte `pos` of `expr`.
fn enclosing_call(expr: &str, pos: usize) -> Option<&str> {
    let mut depth = 0usize;
    for (i, c) in expr[..pos].char_indices().rev() {
        match c {
            ')' => depth += 1,
            '(' if depth > 0 => depth -= 1,
            '(' => {
                let head = &expr[..i];
                let start = head
                    .char_indices()
                    .rev()
                    .take_while(|(_, c)| c.is_ascii_alphanumeric() || *c == '_')
                    .last()
                    .map_or(i, |(p, _)| p);
                return Some(&expr[start..i]);
            }
            _ => {}
        }
    }
    None
}

/// Yields every candidate of `inner` once per region, with only the region
/// setting changed. An empty region list passes candidates through.
pub struct RegionFanOutSource<S> {
    inner: S,
    regions: Vec<String>,
    current: Option<Candidate>,
    next_region: usize,
}

impl<S: CandidateSource> RegionFanOutSource<S> {
    pub fn new(inner: S, regions: Vec<String>) -> Self {
        Self {
            inner,
            regions,
            current: None,
            next_region: 0,
        }
    }
}

impl<S: CandidateSource> CandidateSource for RegionFanOutSource<S> {
    fn next_candidate(&mut self) -> Option<Candidate> {
        if self.regions.is_empty() {
            return self.inner.next_candidate();
        }
        loop {
            if let (Some(base), Some(region)) = (&self.current, self.regions.get(self.next_region)) {
                self.next_region += 1;
                return Some(Candidate::new(
                    base.expression(),
                    base.settings().clone().with_region(region.as_str()),
                    base.strategy_tag(),
                ));
            }
            self.current = Some(self.inner.next_candidate()?);
            self.next_region = 0;
        }
    }
}

/// Drops candidates whose expression or settings fail validation.
pub struct ValidatingSource<S> {
    inner: S,
    validator: Validator,
    rejected: usize,
}

impl<S: CandidateSource> ValidatingSource<S> {
    pub fn new(inner: S, validator: Validator) -> Self {
        Self {
            inner,
            validator,
            rejected: 0,
        }
    }

    /// Candidates dropped so far.
    pub fn rejected(&self) -> usize {
        self.rejected
    }
}

impl<S: CandidateSource> CandidateSource for ValidatingSource<S> {
    fn next_candidate(&mut self) -> Option<Candidate> {
        loop {
            let candidate = self.inner.next_candidate()?;
            let verdict = self
                .validator
                .validate_expression(candidate.expression())
                .and_then(|_| self.validator.validate_settings(candidate.settings()));
            match verdict {
                Ok(()) => return Some(candidate),
                Err(e) => {
                    self.rejected += 1;
                    warn!(
                        candidate_id = %candidate.id().short(),
                        expression = %candidate.expression(),
                        reason = %e,
                        "dropping invalid candidate"
                    );
                }
            }
        }
    }
}
