//! Handles and per-instance operations.
//!
//! These functions work on a bare [`Instance`] and are what both
//! [`Matcher`](super::Matcher) and the parallel filter workers are built on.

use std::num::NonZeroU32;

use crate::error::{IgnoreError, Result};
use crate::memory::{free_bytes, read_bytes, GuestBuffer};
use crate::pool::Instance;
use crate::sandbox::entry;

/// Size of the batch result descriptor: result pointer and length, both i32.
const RESULT_DESCRIPTOR_LEN: usize = 8;

/// Separator between rule lines and between paths in a batch.
pub const LINE_SEPARATOR: char = '\n';

/// A compiled rule set inside one particular instance.
///
/// The raw value is only meaningful to the instance that produced it; the
/// instance id travels with it so a handle can never be used elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatcherHandle {
    instance: u64,
    raw: NonZeroU32,
}

impl MatcherHandle {
    fn from_code(instance: u64, code: i32) -> Option<Self> {
        if code <= 0 {
            return None;
        }
        NonZeroU32::new(code as u32).map(|raw| Self { instance, raw })
    }

    pub fn raw(&self) -> i32 {
        self.raw.get() as i32
    }

    pub fn instance_id(&self) -> u64 {
        self.instance
    }
}

/// Detailed result of testing one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// No rule matched.
    NotMatched,
    /// An ignore rule matched last.
    Ignored,
    /// A negation rule matched last.
    Whitelisted,
}

impl MatchOutcome {
    pub fn is_ignored(self) -> bool {
        self == MatchOutcome::Ignored
    }
}

/// Compile `\n`-joined rule text on `instance`.
pub fn compile_on(instance: &mut Instance, rules: &str) -> Result<MatcherHandle> {
    let code = {
        let mut text = GuestBuffer::write(instance, rules.as_bytes())?;
        let (ptr, len) = (text.ptr(), text.len());
        text.create_matcher(ptr, len)?
    };

    match code {
        -1 | -2 => Err(IgnoreError::InvalidArgument),
        -3 => Err(IgnoreError::CompileFailed),
        code => MatcherHandle::from_code(instance.id(), code).ok_or(
            IgnoreError::UnexpectedCode {
                call: entry::CREATE_MATCHER,
                code,
            },
        ),
    }
}

/// Destroy `handle` on `instance`.
pub fn destroy_on(instance: &mut Instance, handle: MatcherHandle) -> Result<()> {
    instance.destroy_matcher(handle)
}

/// Test one path given as raw bytes.
pub fn match_on(
    instance: &mut Instance,
    handle: MatcherHandle,
    path: &[u8],
    is_dir: bool,
) -> Result<MatchOutcome> {
    let code = {
        let mut buffer = GuestBuffer::write(instance, path)?;
        let (ptr, len) = (buffer.ptr(), buffer.len());
        buffer.is_match(handle, ptr, len, is_dir)?
    };

    match code {
        0 => Ok(MatchOutcome::NotMatched),
        1 => Ok(MatchOutcome::Ignored),
        2 => Ok(MatchOutcome::Whitelisted),
        -1 => Err(IgnoreError::InvalidHandle),
        -2 => Err(IgnoreError::InvalidArgument),
        -3 => Err(IgnoreError::PathEncoding),
        -4 => Err(IgnoreError::HandleNotFound),
        code => Err(IgnoreError::UnexpectedCode {
            call: entry::IS_MATCH,
            code,
        }),
    }
}

/// Filter `paths` in one boundary crossing, keeping the ones not ignored.
///
/// A trailing `/` marks a path as a directory. Paths must not contain `\n`.
pub fn batch_filter_on<S: AsRef<str>>(
    instance: &mut Instance,
    handle: MatcherHandle,
    paths: &[S],
) -> Result<Vec<String>> {
    if paths.is_empty() {
        return Ok(Vec::new());
    }

    let blob = join_lines(paths);
    let mut input = GuestBuffer::write(instance, blob.as_bytes())?;
    let (paths_ptr, paths_len) = (input.ptr(), input.len());

    let mut descriptor = GuestBuffer::zeroed(&mut input, RESULT_DESCRIPTOR_LEN)?;
    let info_ptr = descriptor.ptr();

    let count = descriptor.batch_filter(handle, paths_ptr, paths_len, info_ptr)?;
    match count {
        -1 => return Err(IgnoreError::InvalidHandle),
        -2 => return Err(IgnoreError::NullResultDescriptor),
        -3 => return Err(IgnoreError::InvalidArgument),
        -4 => return Err(IgnoreError::PathEncoding),
        -5 => return Err(IgnoreError::HandleNotFound),
        code if code < 0 => {
            return Err(IgnoreError::UnexpectedCode {
                call: entry::BATCH_FILTER,
                code,
            })
        }
        0 => return Ok(Vec::new()),
        _ => {}
    }

    let info = descriptor.read()?;
    let result_ptr = u32::from_le_bytes([info[0], info[1], info[2], info[3]]);
    let result_len = u32::from_le_bytes([info[4], info[5], info[6], info[7]]);
    if result_ptr == 0 || result_len == 0 {
        return Err(IgnoreError::EmptyResult { count });
    }

    let result = read_bytes(&descriptor, result_ptr, result_len);
    free_bytes(&mut descriptor, result_ptr, result_len);
    let result = String::from_utf8(result?).map_err(|_| IgnoreError::PathEncoding)?;

    Ok(result.split(LINE_SEPARATOR).map(String::from).collect())
}

/// Join lines with the separator the engine splits on.
pub fn join_lines<S: AsRef<str>>(lines: &[S]) -> String {
    let capacity = lines.iter().map(|l| l.as_ref().len() + 1).sum();
    let mut joined = String::with_capacity(capacity);
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            joined.push(LINE_SEPARATOR);
        }
        joined.push_str(line.as_ref());
    }
    joined
}

/// A handle that is destroyed when it goes out of scope.
pub struct ScopedHandle<'a> {
    instance: &'a mut Instance,
    handle: MatcherHandle,
}

impl<'a> ScopedHandle<'a> {
    /// Compile `rules` on `instance` for the lifetime of the guard.
    pub fn compile(instance: &'a mut Instance, rules: &str) -> Result<Self> {
        let handle = compile_on(instance, rules)?;
        Ok(Self { instance, handle })
    }

    pub fn handle(&self) -> MatcherHandle {
        self.handle
    }

    pub fn filter<S: AsRef<str>>(&mut self, paths: &[S]) -> Result<Vec<String>> {
        batch_filter_on(self.instance, self.handle, paths)
    }
}

impl Drop for ScopedHandle<'_> {
    fn drop(&mut self) {
        if let Err(e) = destroy_on(self.instance, self.handle) {
            tracing::debug!("{}: destroy of handle failed: {}", self.instance.name(), e);
        }
    }
}
