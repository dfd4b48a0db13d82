//! Building the history sent with a model round.

use uuid::Uuid;

use crate::conversation::{Content, FileEntry, Part, Role, Turn};
use crate::llm::OutgoingMessage;

/// Contents of the in-progress turn that belong in the next round's history.
///
/// Skips the empty model content just created, the feedback text about to be
/// sent as the message, and the tool content answering the call being sent.
pub fn turn_history(
    turn: &Turn,
    pending_model_content: Uuid,
    message: &OutgoingMessage,
) -> Vec<Content> {
    let outgoing_user = match message {
        OutgoingMessage::Text(_) => turn
            .contents
            .iter()
            .rev()
            .find(|c| c.role == Role::User)
            .map(|c| c.id),
        OutgoingMessage::ToolResponse(_) => None,
    };

    turn.contents
        .iter()
        .filter(|c| c.id != pending_model_content)
        .filter(|c| Some(c.id) != outgoing_user)
        .filter(|c| match message {
            OutgoingMessage::ToolResponse(resp) => {
                !(c.role == Role::Tool && c.responds_to(&resp.id))
            }
            OutgoingMessage::Text(_) => true,
        })
        .cloned()
        .collect()
}

/// Rewrite stored contents into the shape the model accepts.
///
/// Thoughts, errors and grounding never go back to the model. File references
/// become `[Attachment: name]` text. Tool contents keep only function responses.
pub fn model_history(contents: &[Content], files: &[FileEntry]) -> Vec<Content> {
    contents
        .iter()
        .filter_map(|content| {
            let parts: Vec<Part> = content
                .parts
                .iter()
                .filter_map(|part| match (content.role, part) {
                    (Role::Tool, Part::FunctionResponse(_)) => Some(part.clone()),
                    (Role::Tool, _) => None,
                    (_, Part::Text(_) | Part::FunctionCall(_) | Part::FunctionResponse(_)) => {
                        Some(part.clone())
                    }
                    (_, Part::FileRef(id)) => files
                        .iter()
                        .find(|f| f.id == *id)
                        .map(|f| Part::text(format!("[Attachment: {}]", f.name))),
                    (_, Part::Thought { .. } | Part::Error(_) | Part::Grounding(_)) => None,
                })
                .collect();
            if parts.is_empty() {
                return None;
            }
            Some(Content {
                parts,
                ..content.clone()
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{FileCategory, FunctionCall, FunctionResponse, GroundingMetadata};

    #[test]
    fn sanitizes_parts_per_role() {
        let turn_id = Uuid::new_v4();
        let file = FileEntry::new("cells.tif", "image/tiff", FileCategory::Project);
        let contents = vec![
            Content::new(
                turn_id,
                Role::User,
                vec![Part::text("look"), Part::FileRef(file.id), Part::FileRef(Uuid::new_v4())],
            ),
            Content::new(
                turn_id,
                Role::Model,
                vec![
                    Part::thought("hmm"),
                    Part::FunctionCall(FunctionCall {
                        id: "c1".into(),
                        name: "generate_image".into(),
                        args: serde_json::json!({}),
                    }),
                    Part::Grounding(GroundingMetadata::default()),
                ],
            ),
            Content::new(
                turn_id,
                Role::Tool,
                vec![
                    Part::FunctionResponse(FunctionResponse::result("c1", "generate_image", "ok")),
                    Part::text("[System] The tool generated 1 file(s). See attached content."),
                    Part::FileRef(file.id),
                ],
            ),
            Content::new(turn_id, Role::Model, vec![Part::thought("only thinking")]),
        ];

        let history = model_history(&contents, &[file]);
        assert_eq!(history.len(), 3);
        assert_eq!(
            history[0].parts,
            vec![Part::text("look"), Part::text("[Attachment: cells.tif]")]
        );
        assert_eq!(history[1].parts.len(), 1);
        assert!(history[1].parts[0].as_function_call().is_some());
        assert_eq!(history[2].parts.len(), 1);
        assert!(history[2].parts[0].as_function_response().is_some());
    }

    #[test]
    fn turn_history_skips_outgoing_material() {
        let mut turn = Turn::assistant(Uuid::new_v4());
        turn.push_content(Role::Model, vec![Part::text("```python:run\nprint(1)\n```")]);
        let first_feedback = turn.push_content(
            Role::User,
            vec![Part::text("[System Output from python:run]\n1")],
        );
        turn.push_content(Role::Model, vec![Part::text("again")]);
        let feedback = turn.push_content(
            Role::User,
            vec![Part::text("[System Output from python:run]\n2")],
        );
        let pending = turn.push_content(Role::Model, Vec::new());

        let message = OutgoingMessage::Text("[System Output from python:run]\n2".into());
        let ids: Vec<Uuid> = turn_history(&turn, pending, &message).iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&first_feedback));
        assert!(!ids.contains(&feedback));
        assert!(!ids.contains(&pending));
    }

    #[test]
    fn turn_history_skips_matching_tool_response() {
        let mut turn = Turn::assistant(Uuid::new_v4());
        turn.push_content(Role::Model, Vec::new());
        let response = FunctionResponse::result("c9", "generate_image", "done");
        turn.push_content(Role::Tool, vec![Part::FunctionResponse(response.clone())]);
        let pending = turn.push_content(Role::Model, Vec::new());

        let history = turn_history(&turn, pending, &OutgoingMessage::ToolResponse(response));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::Model);
    }
}
