//! Executable code fence scanning.
//!
//! An executable block opens with a run of exactly three or four backticks
//! immediately followed by [`EXEC_MARKER`], and closes with a run of the same
//! length. Runs are measured maximally, so a four-backtick fence can wrap
//! ordinary three-backtick blocks and a mismatched close never matches.

/// Language tag plus execution suffix marking a fence as runnable.
pub const EXEC_MARKER: &str = "python:run";

const FENCE_BYTE: u8 = b'`';

/// A fully delimited executable block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeFence {
    /// Byte offset of the opening fence.
    pub start: usize,
    /// Byte offset just past the closing fence.
    pub end: usize,
    /// Body between the fences, trimmed.
    pub code: String,
}

/// An opening fence with no matching close (yet).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFence {
    pub start: usize,
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FenceScan {
    pub complete: Vec<CodeFence>,
    /// Unterminated fence after the last complete one, if any.
    pub open: Option<OpenFence>,
}

/// Scan text for executable fences, left to right.
pub fn scan(text: &str) -> FenceScan {
    let bytes = text.as_bytes();
    let mut result = FenceScan::default();
    let mut pos = 0;

    while let Some((start, len)) = next_run(bytes, pos) {
        let after = start + len;
        if !(3..=4).contains(&len) || !text[after..].starts_with(EXEC_MARKER) {
            pos = after;
            continue;
        }

        let body_start = after + EXEC_MARKER.len();
        match find_close(bytes, body_start, len) {
            Some(close) => {
                result.open = None;
                result.complete.push(CodeFence {
                    start,
                    end: close + len,
                    code: text[body_start..close].trim().to_string(),
                });
                pos = close + len;
            }
            None => {
                // Everything after the first unterminated opening belongs to
                // it, unless a later fence completes.
                if result.open.is_none() {
                    result.open = Some(OpenFence {
                        start,
                        code: text[body_start..].trim().to_string(),
                    });
                }
                pos = body_start;
            }
        }
    }

    result
}

/// Source of every complete executable block, in order. Empty bodies are skipped.
pub fn extract_executable_blocks(text: &str) -> Vec<String> {
    scan(text)
        .complete
        .into_iter()
        .map(|f| f.code)
        .filter(|code| !code.is_empty())
        .collect()
}

/// Next maximal run of fence characters at or after `from`.
fn next_run(bytes: &[u8], from: usize) -> Option<(usize, usize)> {
    let offset = bytes.get(from..)?.iter().position(|&b| b == FENCE_BYTE)?;
    let start = from + offset;
    let len = bytes[start..].iter().take_while(|&&b| b == FENCE_BYTE).count();
    Some((start, len))
}

fn find_close(bytes: &[u8], from: usize, len: usize) -> Option<usize> {
    let mut pos = from;
    while let Some((start, run)) = next_run(bytes, pos) {
        if run == len {
            return Some(start);
        }
        pos = start + run;
    }
    None
}
