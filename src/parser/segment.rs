//! Turn segmentation into renderable blocks.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::{FileEntry, FileKind, GroundingMetadata, Part, Turn};
use crate::parser::SYSTEM_OUTPUT_PREFIX;
use crate::parser::fence;

static GENERATED_FILES_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[System\] Generated files: (.*)").expect("valid generated files regex")
});

static CATEGORY_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*?) \(.*?\)$").expect("valid category suffix regex"));

/// Progress of a deferred result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Pending,
    Running,
    Complete,
}

/// A file surfaced by a code block's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: Uuid,
    pub name: String,
    pub kind: FileKind,
}

/// A render-oriented segment of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        content: String,
    },
    Thinking {
        content: String,
        /// Still being streamed.
        live: bool,
    },
    Code {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        status: BlockStatus,
        #[serde(default)]
        attachments: Vec<AttachmentRef>,
    },
    Tool {
        name: String,
        args: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        status: BlockStatus,
    },
    Attachments {
        file_ids: Vec<Uuid>,
    },
    Grounding {
        metadata: GroundingMetadata,
    },
    Error {
        content: String,
    },
}

/// Convert a turn's linear part sequence into blocks.
///
/// Pure: the same turn and files always yield the same blocks.
pub fn segment(turn: &Turn, known_files: &[FileEntry]) -> Vec<Block> {
    Segmenter::new(turn, known_files).run()
}

struct Segmenter<'a> {
    parts: Vec<&'a Part>,
    files: &'a [FileEntry],
    streaming: bool,
    blocks: Vec<Block>,
    buffer: String,
    /// System-output parts already attached to a code block.
    claimed_outputs: HashSet<usize>,
}

impl<'a> Segmenter<'a> {
    fn new(turn: &'a Turn, files: &'a [FileEntry]) -> Self {
        Self {
            parts: turn.parts().map(|(_, part)| part).collect(),
            files,
            streaming: turn.is_streaming(),
            blocks: Vec::new(),
            buffer: String::new(),
            claimed_outputs: HashSet::new(),
        }
    }

    fn run(mut self) -> Vec<Block> {
        let last = self.parts.len().saturating_sub(1);
        for i in 0..self.parts.len() {
            let part = self.parts[i];
            match part {
                Part::Error(message) => {
                    self.flush_text();
                    self.blocks.push(Block::Error {
                        content: message.clone(),
                    });
                }
                Part::Thought { text, .. } => {
                    self.flush_text();
                    self.blocks.push(Block::Thinking {
                        content: text.clone(),
                        live: self.streaming && i == last,
                    });
                }
                Part::FunctionCall(call) => {
                    self.flush_text();
                    let response = self.parts[i + 1..]
                        .iter()
                        .filter_map(|p| p.as_function_response())
                        .find(|r| r.id == call.id);
                    let (result, status) = match response {
                        Some(resp) => (Some(resp.display_text()), BlockStatus::Complete),
                        None => (None, self.unfinished_status()),
                    };
                    self.blocks.push(Block::Tool {
                        name: call.name.clone(),
                        args: call.args.clone(),
                        result,
                        status,
                    });
                }
                Part::FunctionResponse(_) => {}
                Part::Grounding(metadata) => {
                    if metadata.is_empty() {
                        continue;
                    }
                    self.flush_text();
                    self.blocks.push(Block::Grounding {
                        metadata: metadata.clone(),
                    });
                }
                Part::FileRef(id) => {
                    self.flush_text();
                    match self.blocks.last_mut() {
                        Some(Block::Attachments { file_ids }) => file_ids.push(*id),
                        _ => self.blocks.push(Block::Attachments {
                            file_ids: vec![*id],
                        }),
                    }
                }
                Part::Text(text) => {
                    if self.claimed_outputs.contains(&i) {
                        continue;
                    }
                    self.buffer.push_str(text);
                    self.scan_buffer(i);
                }
            }
        }

        self.flush_text();
        self.blocks
    }

    /// Emit complete code fences found in the buffer, then any trailing open fence.
    fn scan_buffer(&mut self, index: usize) {
        let scan = fence::scan(&self.buffer);
        let mut consumed = 0;

        for code_fence in scan.complete {
            let before = self.buffer[consumed..code_fence.start].to_string();
            self.push_text(before);

            let (result, attachments) = match self.claim_output(index) {
                Some((result, attachments)) => (Some(result), attachments),
                None => (None, Vec::new()),
            };
            let status = if result.is_some() {
                BlockStatus::Complete
            } else {
                self.unfinished_status()
            };
            self.blocks.push(Block::Code {
                code: code_fence.code,
                result,
                status,
                attachments,
            });
            consumed = code_fence.end;
        }

        if self.streaming
            && let Some(open) = scan.open
        {
            let before = self.buffer[consumed..open.start].to_string();
            self.push_text(before);
            self.blocks.push(Block::Code {
                code: open.code,
                result: None,
                status: BlockStatus::Running,
                attachments: Vec::new(),
            });
            self.buffer.clear();
            return;
        }

        self.buffer.drain(..consumed);
    }

    /// Find the first unclaimed system-output part after `index`.
    fn claim_output(&mut self, index: usize) -> Option<(String, Vec<AttachmentRef>)> {
        let (j, result) = self
            .parts
            .iter()
            .enumerate()
            .skip(index + 1)
            .filter(|(j, _)| !self.claimed_outputs.contains(j))
            .find_map(|(j, p)| {
                p.as_text()
                    .and_then(|t| t.strip_prefix(SYSTEM_OUTPUT_PREFIX))
                    .map(|rest| (j, rest.trim().to_string()))
            })?;
        self.claimed_outputs.insert(j);
        let attachments = self.resolve_generated(&result);
        Some((result, attachments))
    }

    fn resolve_generated(&self, output: &str) -> Vec<AttachmentRef> {
        let Some(captures) = GENERATED_FILES_LINE.captures(output) else {
            return Vec::new();
        };
        captures[1]
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| {
                let name = CATEGORY_SUFFIX
                    .captures(entry)
                    .and_then(|c| c.get(1))
                    .map_or(entry, |m| m.as_str());
                // Most recent file wins on a name collision.
                self.files.iter().rev().find(|f| f.name == name)
            })
            .map(|f| AttachmentRef {
                id: f.id,
                name: f.name.clone(),
                kind: f.kind,
            })
            .collect()
    }

    fn unfinished_status(&self) -> BlockStatus {
        if self.streaming {
            BlockStatus::Running
        } else {
            BlockStatus::Pending
        }
    }

    fn push_text(&mut self, text: String) {
        if !text.trim().is_empty() {
            self.blocks.push(Block::Text { content: text });
        }
    }

    fn flush_text(&mut self) {
        let text = std::mem::take(&mut self.buffer);
        self.push_text(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{
        Content, FileCategory, FunctionCall, FunctionResponse, GroundingChunk, Role, TurnStatus,
    };

    fn turn_with(status: TurnStatus, contents: Vec<(Role, Vec<Part>)>) -> Turn {
        let mut turn = Turn::assistant(Uuid::new_v4());
        for (role, parts) in contents {
            turn.contents.push(Content::new(turn.id, role, parts));
        }
        turn.status = status;
        turn
    }

    fn call(id: &str, name: &str) -> Part {
        Part::FunctionCall(FunctionCall {
            id: id.into(),
            name: name.into(),
            args: serde_json::json!({"prompt": "cat"}),
        })
    }

    #[test]
    fn plain_text_is_one_block() {
        let turn = turn_with(
            TurnStatus::Complete,
            vec![(Role::Model, vec![Part::text("Hello!")])],
        );
        assert_eq!(
            segment(&turn, &[]),
            vec![Block::Text {
                content: "Hello!".into()
            }]
        );
    }

    #[test]
    fn streaming_code_block_without_output_is_running() {
        let turn = turn_with(
            TurnStatus::Streaming,
            vec![(Role::Model, vec![Part::text("```python:run\nprint(1)\n```")])],
        );
        let blocks = segment(&turn, &[]);
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            Block::Code {
                code,
                status,
                result,
                ..
            } => {
                assert_eq!(code, "print(1)");
                assert_eq!(*status, BlockStatus::Running);
                assert!(result.is_none());
            }
            other => panic!("expected code block, got {other:?}"),
        }
    }

    #[test]
    fn code_block_consumes_system_output() {
        let plot = FileEntry::new("plot.png", "image/png", FileCategory::Session);
        let output = format!(
            "{SYSTEM_OUTPUT_PREFIX}\n42\n[System] Generated files: plot.png (session)"
        );
        let turn = turn_with(
            TurnStatus::Complete,
            vec![
                (
                    Role::Model,
                    vec![Part::text("Running:\n```python:run\nprint(42)\n```")],
                ),
                (Role::User, vec![Part::text(output), Part::FileRef(plot.id)]),
                (Role::Model, vec![Part::text("The answer is 42.")]),
            ],
        );

        let blocks = segment(&turn, std::slice::from_ref(&plot));
        assert_eq!(blocks.len(), 4);
        assert_eq!(
            blocks[0],
            Block::Text {
                content: "Running:\n".into()
            }
        );
        match &blocks[1] {
            Block::Code {
                result,
                status,
                attachments,
                ..
            } => {
                assert_eq!(*status, BlockStatus::Complete);
                assert_eq!(
                    result.as_deref(),
                    Some("42\n[System] Generated files: plot.png (session)")
                );
                assert_eq!(attachments.len(), 1);
                assert_eq!(attachments[0].id, plot.id);
            }
            other => panic!("expected code block, got {other:?}"),
        }
        assert_eq!(
            blocks[2],
            Block::Attachments {
                file_ids: vec![plot.id]
            }
        );
        assert_eq!(
            blocks[3],
            Block::Text {
                content: "The answer is 42.".into()
            }
        );
    }

    #[test]
    fn generated_name_collision_prefers_latest_file() {
        let old = FileEntry::new("out.png", "image/png", FileCategory::Session);
        let new = FileEntry::new("out.png", "image/png", FileCategory::Session);
        let output = format!("{SYSTEM_OUTPUT_PREFIX}\n[System] Generated files: out.png (session)");
        let turn = turn_with(
            TurnStatus::Complete,
            vec![
                (Role::Model, vec![Part::text("```python:run\nsave()\n```")]),
                (Role::User, vec![Part::text(output)]),
            ],
        );
        let blocks = segment(&turn, &[old, new.clone()]);
        match &blocks[0] {
            Block::Code { attachments, .. } => assert_eq!(attachments[0].id, new.id),
            other => panic!("expected code block, got {other:?}"),
        }
    }

    #[test]
    fn system_output_claimed_once() {
        let output = format!("{SYSTEM_OUTPUT_PREFIX}\nfirst");
        let turn = turn_with(
            TurnStatus::Complete,
            vec![
                (
                    Role::Model,
                    vec![Part::text(
                        "```python:run\na()\n```\n```python:run\nb()\n```",
                    )],
                ),
                (Role::User, vec![Part::text(output)]),
            ],
        );
        let blocks = segment(&turn, &[]);
        let statuses: Vec<BlockStatus> = blocks
            .iter()
            .filter_map(|b| match b {
                Block::Code { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![BlockStatus::Complete, BlockStatus::Pending]);
        assert!(!blocks.iter().any(|b| matches!(b, Block::Text { .. })));
    }

    #[test]
    fn four_backtick_fence_code_is_exact() {
        let turn = turn_with(
            TurnStatus::Complete,
            vec![(
                Role::Model,
                vec![Part::text("````python:run\n  s = \"```\"\n````")],
            )],
        );
        match &segment(&turn, &[])[0] {
            Block::Code { code, .. } => assert_eq!(code, "s = \"```\""),
            other => panic!("expected code block, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_fence_is_text_when_complete() {
        let text = "````python:run\nprint(1)\n```";
        let turn = turn_with(TurnStatus::Complete, vec![(Role::Model, vec![Part::text(text)])]);
        assert_eq!(
            segment(&turn, &[]),
            vec![Block::Text {
                content: text.into()
            }]
        );
    }

    #[test]
    fn later_block_survives_a_stray_opener() {
        let turn = turn_with(
            TurnStatus::Complete,
            vec![(
                Role::Model,
                vec![Part::text("````python:run\nbroken\n```\n```python:run\nprint(2)\n```")],
            )],
        );
        let blocks = segment(&turn, &[]);
        assert_eq!(
            blocks,
            vec![
                Block::Text {
                    content: "````python:run\nbroken\n```\n".into()
                },
                Block::Code {
                    code: "print(2)".into(),
                    result: None,
                    status: BlockStatus::Pending,
                    attachments: Vec::new(),
                },
            ]
        );
    }

    #[test]
    fn open_fence_while_streaming_is_running_code() {
        let turn = turn_with(
            TurnStatus::Streaming,
            vec![(
                Role::Model,
                vec![Part::text("Let me check.\n```python:run\nimport numpy as np\n")],
            )],
        );
        let blocks = segment(&turn, &[]);
        assert_eq!(blocks.len(), 2);
        assert_eq!(
            blocks[0],
            Block::Text {
                content: "Let me check.\n".into()
            }
        );
        assert!(matches!(
            &blocks[1],
            Block::Code { code, status: BlockStatus::Running, result: None, .. }
                if code == "import numpy as np"
        ));
    }

    #[test]
    fn fence_split_across_parts_is_joined() {
        let turn = turn_with(
            TurnStatus::Complete,
            vec![(
                Role::Model,
                vec![Part::text("```python:run\nx = 1"), Part::text("\n```")],
            )],
        );
        let blocks = segment(&turn, &[]);
        assert!(matches!(&blocks[0], Block::Code { code, .. } if code == "x = 1"));
    }

    #[test]
    fn tool_call_matched_with_response() {
        let turn = turn_with(
            TurnStatus::Complete,
            vec![
                (Role::Model, vec![call("c1", "generate_image")]),
                (
                    Role::Tool,
                    vec![Part::FunctionResponse(FunctionResponse::result(
                        "c1",
                        "generate_image",
                        "Successfully generated 1 image(s).",
                    ))],
                ),
            ],
        );
        let blocks = segment(&turn, &[]);
        assert_eq!(blocks.len(), 1);
        assert!(matches!(
            &blocks[0],
            Block::Tool { status: BlockStatus::Complete, result: Some(r), .. }
                if r == "Successfully generated 1 image(s)."
        ));
    }

    #[test]
    fn unmatched_tool_call_status_depends_on_turn() {
        let streaming = turn_with(
            TurnStatus::Streaming,
            vec![(Role::Model, vec![call("c1", "generate_image")])],
        );
        assert!(matches!(
            &segment(&streaming, &[])[0],
            Block::Tool { status: BlockStatus::Running, result: None, .. }
        ));

        let done = turn_with(
            TurnStatus::Complete,
            vec![(Role::Model, vec![call("c1", "generate_image")])],
        );
        assert!(matches!(
            &segment(&done, &[])[0],
            Block::Tool { status: BlockStatus::Pending, .. }
        ));
    }

    #[test]
    fn dangling_response_is_ignored() {
        let turn = turn_with(
            TurnStatus::Complete,
            vec![(
                Role::Tool,
                vec![Part::FunctionResponse(FunctionResponse::error("x", "t", "e"))],
            )],
        );
        assert!(segment(&turn, &[]).is_empty());
    }

    #[test]
    fn consecutive_file_refs_merge() {
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let parts = ids.iter().copied().map(Part::FileRef).collect();
        let turn = turn_with(TurnStatus::Complete, vec![(Role::User, parts)]);
        assert_eq!(
            segment(&turn, &[]),
            vec![Block::Attachments {
                file_ids: ids.clone()
            }]
        );
    }

    #[test]
    fn text_between_files_splits_attachments() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let turn = turn_with(
            TurnStatus::Complete,
            vec![(
                Role::User,
                vec![Part::FileRef(a), Part::text("and"), Part::FileRef(b)],
            )],
        );
        let blocks = segment(&turn, &[]);
        assert_eq!(blocks.len(), 3);
    }

    #[test]
    fn thought_live_only_when_last_and_streaming() {
        let turn = turn_with(
            TurnStatus::Streaming,
            vec![(
                Role::Model,
                vec![Part::thought("first"), Part::text("x"), Part::thought("second")],
            )],
        );
        let live: Vec<bool> = segment(&turn, &[])
            .into_iter()
            .filter_map(|b| match b {
                Block::Thinking { live, .. } => Some(live),
                _ => None,
            })
            .collect();
        assert_eq!(live, vec![false, true]);
    }

    #[test]
    fn empty_grounding_does_not_split_text() {
        let turn = turn_with(
            TurnStatus::Complete,
            vec![(
                Role::Model,
                vec![
                    Part::text("Hello "),
                    Part::Grounding(GroundingMetadata::default()),
                    Part::text("world"),
                ],
            )],
        );
        assert_eq!(
            segment(&turn, &[]),
            vec![Block::Text {
                content: "Hello world".into()
            }]
        );
    }

    #[test]
    fn grounding_and_error_blocks() {
        let meta = GroundingMetadata {
            chunks: vec![GroundingChunk {
                uri: Some("https://example.org".into()),
                title: Some("Example".into()),
            }],
            ..Default::default()
        };
        let turn = turn_with(
            TurnStatus::Error,
            vec![(
                Role::Model,
                vec![
                    Part::text("Found it"),
                    Part::Grounding(meta.clone()),
                    Part::Error("stream dropped".into()),
                ],
            )],
        );
        assert_eq!(
            segment(&turn, &[]),
            vec![
                Block::Text {
                    content: "Found it".into()
                },
                Block::Grounding { metadata: meta },
                Block::Error {
                    content: "stream dropped".into()
                },
            ]
        );
    }

    #[test]
    fn segmentation_is_idempotent() {
        let plot = FileEntry::new("plot.png", "image/png", FileCategory::Session);
        let turn = turn_with(
            TurnStatus::Complete,
            vec![
                (
                    Role::Model,
                    vec![
                        Part::thought("plan"),
                        Part::text("```python:run\nplot()\n```"),
                        call("c1", "generate_image"),
                    ],
                ),
                (
                    Role::User,
                    vec![Part::text(format!(
                        "{SYSTEM_OUTPUT_PREFIX}\n[System] Generated files: plot.png (session)"
                    ))],
                ),
            ],
        );
        let files = vec![plot];
        let first = serde_json::to_string(&segment(&turn, &files)).unwrap();
        let second = serde_json::to_string(&segment(&turn, &files)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unclaimed_system_output_renders_as_text() {
        let output = format!("{SYSTEM_OUTPUT_PREFIX}\nstray");
        let turn = turn_with(
            TurnStatus::Complete,
            vec![(Role::User, vec![Part::text(output.clone())])],
        );
        assert_eq!(segment(&turn, &[]), vec![Block::Text { content: output }]);
    }
}
