use serde::de::IgnoredAny;

use crate::ingestion::Document;

/// Pulls the JSON payload out of a model reply that may be wrapped in prose or
/// markdown fences.
///
/// A fenced block wins when its contents parse. Otherwise the outermost
/// `{...}` and `[...]` spans are tried and the earliest one that parses is
/// returned, so stray brackets in surrounding prose do not hide the payload.
pub fn clean_json_output(raw: &str) -> &str {
    if let Some(fenced) = fenced_block(raw).filter(|block| parses(block)) {
        return fenced;
    }

    let candidates = [span(raw, '{', '}'), span(raw, '[', ']')];
    let parsed = candidates
        .iter()
        .flatten()
        .filter(|(_, text)| parses(text))
        .min_by_key(|(start, _)| *start);

    if let Some(&(_, text)) = parsed {
        return text;
    }

    // nothing parses; hand back the earliest span so the error names it
    candidates
        .into_iter()
        .flatten()
        .min_by_key(|(start, _)| *start)
        .map(|(_, text)| text)
        .unwrap_or_else(|| raw.trim())
}

fn fenced_block(raw: &str) -> Option<&str> {
    let open = raw.find("```")?;
    let after_fence = &raw[open + 3..];
    // skip the info string (`json`, `JSON`, ...) up to the end of the line
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

fn span(raw: &str, open: char, close: char) -> Option<(usize, &str)> {
    let start = raw.find(open)?;
    let end = raw.rfind(close)?;
    (end > start).then(|| (start, &raw[start..=end]))
}

fn parses(text: &str) -> bool {
    serde_json::from_str::<IgnoredAny>(text).is_ok()
}

/// Lists attached documents in order so the model can refer to them by position.
pub fn create_document_manifest(documents: &[Document]) -> String {
    let mut manifest = String::from("### DOCUMENT MANIFEST\n");
    manifest.push_str(&format!(
        "You have received {} document(s), attached in this order:\n",
        documents.len()
    ));

    for (i, doc) in documents.iter().enumerate() {
        manifest.push_str(&format!(
            "  Document {}: \"{}\" ({})\n",
            i + 1,
            doc.display_name,
            doc.mime_type
        ));
    }

    manifest.push_str(
        "Return exactly one `documentTypes` entry per document, in the same order as this manifest.\n",
    );
    manifest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_json_output_strips_fences() {
        let raw = "Here you go:\n```json\n{\"a\": [1, 2]}\n```\n";
        assert_eq!(clean_json_output(raw), "{\"a\": [1, 2]}");
    }

    #[test]
    fn test_clean_json_output_prefers_leading_array() {
        let raw = "[{\"op\": \"add\", \"path\": \"/x\", \"value\": {}}]";
        assert_eq!(clean_json_output(raw), raw);
    }

    #[test]
    fn test_clean_json_output_skips_brackets_in_prose() {
        let raw = "Based on the [2024] IRS limits, here is the report:\n```json\n{\"strategies\": [{\"title\": \"Maximize 401k\"}]}\n```";
        assert_eq!(
            clean_json_output(raw),
            "{\"strategies\": [{\"title\": \"Maximize 401k\"}]}"
        );

        let unfenced = "Per [IRS Pub 590-A]: {\"documentTypes\": []} (see [1])";
        assert_eq!(clean_json_output(unfenced), "{\"documentTypes\": []}");
    }

    #[test]
    fn test_clean_json_output_keeps_patch_arrays_whole() {
        let raw = "Here is the patch:\n[{\"op\": \"add\", \"path\": \"/strategies\", \"value\": []}]";
        assert_eq!(
            clean_json_output(raw),
            "[{\"op\": \"add\", \"path\": \"/strategies\", \"value\": []}]"
        );
    }

    #[test]
    fn test_clean_json_output_without_json() {
        assert_eq!(clean_json_output("  no json here "), "no json here");
    }

    #[test]
    fn test_manifest_lists_documents_in_order() {
        let docs = vec![
            Document::from_bytes("2023_1040.pdf", "application/pdf", vec![]),
            Document::from_uri("w2.png", "image/png", "https://files/abc"),
        ];
        let manifest = create_document_manifest(&docs);
        let first = manifest.find("Document 1: \"2023_1040.pdf\"").unwrap();
        let second = manifest.find("Document 2: \"w2.png\" (image/png)").unwrap();
        assert!(first < second);
    }
}
