//! Prompts for title-block metadata extraction.
//!
//! Kept apart from [`crate::pipeline::llm`] so the wording can change
//! without touching the request or parsing code, and so tests can check the
//! prompt names every field the parser accepts.

/// Fields of the title block, in the order they appear in the schema. The
/// reply parser keeps only these keys.
pub(crate) const METADATA_FIELDS: &[&str] = &[
    "project_name",
    "consultant",
    "contractor",
    "sub_contractor",
    "drawing_title",
    "drawing_no",
    "scale",
    "date",
    "rev",
    "project_engineer",
    "drawn_by",
    "site_engineer",
];

/// System prompt for extracting title-block metadata from a drawing sheet.
pub const TITLE_BLOCK_SYSTEM_PROMPT: &str = r#"You read engineering drawing sheets. Each sheet has a title block, usually in the bottom-right corner or along the right edge, listing the project, the parties involved and the drawing's identifiers.

Extract the title-block fields and answer with ONE JSON object and nothing else:

{
  "project_name": string or null,
  "consultant": string or null,
  "contractor": string or null,
  "sub_contractor": string or null,
  "drawing_title": string or null,
  "drawing_no": string or null,
  "scale": string or null,
  "date": string or null,
  "rev": string or null,
  "project_engineer": string or null,
  "drawn_by": string or null,
  "site_engineer": string or null
}

Rules:
- Copy values exactly as printed; do not translate, expand or reformat them.
- If a field is missing or unreadable, use null. Never guess.
- Do NOT wrap the object in ```json fences.
- Do NOT add commentary before or after the object."#;

/// User-turn text sent alongside the page image.
pub const TITLE_BLOCK_USER_PROMPT: &str =
    "Extract the title-block metadata of this drawing sheet.";
