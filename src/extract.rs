//! Text extraction: direct decode and vision-model extraction.
//!
//! The strategy comes from the classifier alone:
//!
//! ```text
//! text-like ──────────▶ direct decode ──────────────▶ text | empty + Decode error
//! unsupported ────────▶ direct decode (fallback) ───▶ text | empty + Decode error
//! image/pdf-like ─────▶ vision model ─┬─ ok ───────▶ text
//!                                     └─ any error ─▶ fallback decode (fallback_applied)
//! ```
//!
//! Extraction never fails the pipeline: every path produces an
//! [`ExtractionResult`] whose `text` is defined, possibly empty.
//!
//! # Oversized input
//!
//! PDFs larger than `limits.vision_max_bytes` are split into page ranges
//! that each fit under the cap (at most `limits.max_vision_chunks`) and sent
//! one by one; the texts are joined in page order. If some chunks fail, the
//! text of the others is kept and the result carries the first chunk error,
//! so the record is stored as `partial`. Oversized images cannot
//! be split and are reported as `UnsupportedContent`, which triggers the
//! fallback.

use std::sync::Arc;
use std::time::Duration;

use crate::classify::{self, strategy_for};
use crate::config::{LimitsConfig, ModelConfig};
use crate::error::PipelineError;
use crate::model::{Attachment, AttachmentKind, GenerativeModel, ModelRequest, ModelResponse};
use crate::models::{
    ContentClass, ExtractionResult, ExtractionStrategy, RawObject, StepFailure, TokenUsage,
};
use crate::retry::{self, Deadline, RetryPolicy, Step};

pub const MIME_PDF: &str = "application/pdf";

const EXTRACTION_PROMPT: &str = "\
Please extract all text content from this document.
Provide the extracted text in a clean, readable format.
Maintain the original structure and reading order.
If there are tables or lists, preserve them as plain text rows and items in their original order.
If there are multiple sections, clearly separate them.

Return only the extracted text content, without any additional commentary.";

const CHUNK_SEPARATOR: &str = "\n\n";

/// Interpret bytes as UTF-8 text. A leading byte-order mark is dropped.
pub fn direct_decode(bytes: &[u8]) -> Result<String, PipelineError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    std::str::from_utf8(bytes)
        .map(|s| s.to_string())
        .map_err(|e| PipelineError::Decode(e.to_string()))
}

/// Text layer embedded in a PDF, if the PDF has one.
pub fn pdf_text_layer(bytes: &[u8]) -> Result<String, PipelineError> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| PipelineError::UnsupportedContent(format!("PDF text layer: {}", e)))
}

/// Decoder used after the vision strategy gave up. PDFs get a chance to
/// yield their text layer before plain UTF-8 decoding is tried.
pub fn fallback_decode(bytes: &[u8], class: ContentClass) -> Result<String, PipelineError> {
    if class == ContentClass::PdfLike {
        match pdf_text_layer(bytes) {
            Ok(text) if !text.trim().is_empty() => return Ok(text),
            Ok(_) => tracing::debug!("PDF has no text layer"),
            Err(e) => tracing::debug!(error = %e, "PDF text layer unavailable"),
        }
    }
    direct_decode(bytes)
}

/// Media type and block kind sent to the model for a vision-classified object.
fn vision_media_type(
    content_type: &str,
    key: &str,
    class: ContentClass,
) -> Result<(String, AttachmentKind), PipelineError> {
    if class == ContentClass::PdfLike {
        return Ok((MIME_PDF.to_string(), AttachmentKind::Document));
    }
    let declared = classify::essence(content_type);
    let media_type = if declared.starts_with("image/") {
        declared
    } else {
        classify::guess_content_type(key)
            .filter(|m| m.starts_with("image/"))
            .map(|m| m.to_string())
            .ok_or_else(|| {
                PipelineError::UnsupportedContent(format!("no image media type for {}", key))
            })?
    };
    Ok((media_type, AttachmentKind::Image))
}

/// Split a PDF into page-range sub-documents that each fit in `cap` bytes.
///
/// Starts from the fewest even ranges the size suggests and doubles the
/// number of ranges until every range fits. Single pages that still exceed
/// the cap are skipped. At most `max_chunks` chunks are returned, in page
/// order.
pub fn split_pdf(bytes: &[u8], cap: usize, max_chunks: usize) -> Result<Vec<Vec<u8>>, PipelineError> {
    let doc = lopdf::Document::load_mem(bytes)
        .map_err(|e| PipelineError::UnsupportedContent(format!("unreadable PDF: {}", e)))?;
    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    if pages.is_empty() {
        return Err(PipelineError::UnsupportedContent(
            "PDF has no pages".to_string(),
        ));
    }

    let mut groups = bytes.len().div_ceil(cap.max(1)).max(2).min(pages.len());
    loop {
        let mut chunks = Vec::new();
        let mut too_large = false;

        for range in page_ranges(pages.len(), groups) {
            let sub = pdf_subset(&doc, &pages, range.clone())?;
            if sub.len() <= cap {
                chunks.push(sub);
            } else if range.len() == 1 {
                tracing::warn!(
                    page = pages[range.start],
                    bytes = sub.len(),
                    cap,
                    "skipping PDF page larger than the vision limit"
                );
            } else {
                too_large = true;
                break;
            }
        }

        if !too_large {
            if chunks.is_empty() {
                return Err(PipelineError::UnsupportedContent(
                    "every PDF page exceeds the vision size limit".to_string(),
                ));
            }
            if chunks.len() > max_chunks {
                tracing::warn!(
                    chunks = chunks.len(),
                    max_chunks,
                    "PDF truncated to the vision chunk limit"
                );
                chunks.truncate(max_chunks);
            }
            return Ok(chunks);
        }

        groups = (groups * 2).min(pages.len());
    }
}

/// `n` items split into `groups` contiguous, near-equal index ranges.
fn page_ranges(n: usize, groups: usize) -> Vec<std::ops::Range<usize>> {
    let groups = groups.clamp(1, n.max(1));
    let base = n / groups;
    let extra = n % groups;
    let mut ranges = Vec::with_capacity(groups);
    let mut start = 0;
    for i in 0..groups {
        let len = base + usize::from(i < extra);
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

fn pdf_subset(
    doc: &lopdf::Document,
    pages: &[u32],
    keep: std::ops::Range<usize>,
) -> Result<Vec<u8>, PipelineError> {
    let mut sub = doc.clone();
    let drop: Vec<u32> = pages
        .iter()
        .enumerate()
        .filter(|(i, _)| !keep.contains(i))
        .map(|(_, p)| *p)
        .collect();
    sub.delete_pages(&drop);
    sub.prune_objects();

    let mut out = Vec::new();
    sub.save_to(&mut out)
        .map_err(|e| PipelineError::UnsupportedContent(format!("PDF split failed: {}", e)))?;
    Ok(out)
}

/// Runs the extraction strategy chosen by the classifier.
pub struct TextExtractor {
    model: Arc<dyn GenerativeModel>,
    policy: RetryPolicy,
    call_timeout: Duration,
    vision_max_bytes: usize,
    max_vision_chunks: usize,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

impl TextExtractor {
    pub fn new(
        model: Arc<dyn GenerativeModel>,
        policy: RetryPolicy,
        model_config: &ModelConfig,
        limits: &LimitsConfig,
    ) -> Self {
        Self {
            model,
            policy,
            call_timeout: model_config.timeout(),
            vision_max_bytes: limits.vision_max_bytes,
            max_vision_chunks: limits.max_vision_chunks,
            max_tokens: model_config.extraction_max_tokens,
            temperature: model_config.extraction_temperature,
            top_p: model_config.top_p,
        }
    }

    pub async fn extract(
        &self,
        object: &RawObject,
        key: &str,
        class: ContentClass,
        deadline: &Deadline,
    ) -> ExtractionResult {
        match strategy_for(class) {
            ExtractionStrategy::Direct => {
                decode_result(&object.bytes, class, class == ContentClass::Unsupported, None)
            }
            ExtractionStrategy::Vision => match self.extract_vision(object, key, class, deadline).await {
                Ok(vision) => ExtractionResult {
                    text: vision.text,
                    strategy_used: ExtractionStrategy::Vision,
                    fallback_applied: false,
                    extraction_error: vision.failure,
                    token_usage: Some(vision.usage),
                },
                Err(err) => {
                    tracing::warn!(
                        key,
                        error = %err,
                        kind = err.kind(),
                        "vision extraction failed, falling back to direct decode"
                    );
                    decode_result(&object.bytes, class, true, Some(err))
                }
            },
        }
    }

    /// Vision text of the whole object. For a chunked PDF, chunks that fail
    /// are left out and the first failure is reported alongside the text;
    /// only when every chunk fails is the error returned.
    async fn extract_vision(
        &self,
        object: &RawObject,
        key: &str,
        class: ContentClass,
        deadline: &Deadline,
    ) -> Result<VisionText, PipelineError> {
        let (media_type, kind) = vision_media_type(&object.content_type, key, class)?;

        if object.bytes.len() <= self.vision_max_bytes {
            let response = self
                .call_vision(&object.bytes, &media_type, kind, None, deadline)
                .await?;
            return Ok(VisionText {
                text: response.text,
                usage: response.usage,
                failure: None,
            });
        }

        if kind == AttachmentKind::Image {
            return Err(PipelineError::UnsupportedContent(format!(
                "image of {} bytes exceeds the {} byte vision limit",
                object.bytes.len(),
                self.vision_max_bytes
            )));
        }

        let chunks = split_pdf(&object.bytes, self.vision_max_bytes, self.max_vision_chunks)?;
        tracing::info!(key, chunks = chunks.len(), "sending oversized PDF in page chunks");

        let total = chunks.len();
        let mut parts = Vec::with_capacity(total);
        let mut usage = TokenUsage::default();
        let mut first_error: Option<(usize, PipelineError)> = None;
        for (i, chunk) in chunks.iter().enumerate() {
            let part = i + 1;
            match self
                .call_vision(chunk, &media_type, kind, Some((part, total)), deadline)
                .await
            {
                Ok(response) => {
                    usage.add(response.usage);
                    parts.push(response.text);
                }
                Err(err) => {
                    tracing::warn!(key, part, total, error = %err, "vision chunk failed");
                    first_error.get_or_insert((part, err));
                }
            }
        }

        match first_error {
            Some((_, err)) if parts.is_empty() => Err(err),
            failed => Ok(VisionText {
                text: parts.join(CHUNK_SEPARATOR),
                usage,
                failure: failed.map(|(part, err)| StepFailure {
                    kind: err.kind().to_string(),
                    message: format!("part {} of {}: {}", part, total, err),
                }),
            }),
        }
    }

    async fn call_vision(
        &self,
        bytes: &[u8],
        media_type: &str,
        kind: AttachmentKind,
        part: Option<(usize, usize)>,
        deadline: &Deadline,
    ) -> Result<ModelResponse, PipelineError> {
        let prompt = match part {
            Some((n, total)) => format!(
                "{}\n\nThis is part {} of {} of a longer document; extract only this part.",
                EXTRACTION_PROMPT, n, total
            ),
            None => EXTRACTION_PROMPT.to_string(),
        };
        let request = ModelRequest {
            prompt,
            attachment: Some(Attachment {
                kind,
                media_type,
                bytes,
            }),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
        };

        let response = retry::with_backoff(
            &self.policy,
            Step::Extract,
            self.call_timeout,
            deadline,
            || self.model.invoke(&request),
        )
        .await?;

        tracing::debug!(
            model = self.model.model_id(),
            chars = response.text.len(),
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "vision extraction succeeded"
        );
        Ok(response)
    }
}

struct VisionText {
    text: String,
    usage: TokenUsage,
    /// First chunk failure when some, but not all, chunks were extracted.
    failure: Option<StepFailure>,
}

/// Direct-decode `bytes`. `cause` is the vision failure that led here, if any;
/// it takes precedence as the recorded extraction error.
fn decode_result(
    bytes: &[u8],
    class: ContentClass,
    fallback_applied: bool,
    cause: Option<PipelineError>,
) -> ExtractionResult {
    let decoded = if fallback_applied {
        fallback_decode(bytes, class)
    } else {
        direct_decode(bytes)
    };

    let (text, decode_error) = match decoded {
        Ok(text) => (text, None),
        Err(err) => {
            tracing::warn!(error = %err, "direct decode failed, continuing with empty text");
            (String::new(), Some(err))
        }
    };

    let extraction_error = match (cause, decode_error) {
        (Some(cause), Some(decode)) => Some(StepFailure {
            kind: cause.kind().to_string(),
            message: format!("{}; fallback decode: {}", cause, decode),
        }),
        (Some(cause), None) => Some(StepFailure::from(&cause)),
        (None, Some(decode)) => Some(StepFailure::from(&decode)),
        (None, None) => None,
    };

    ExtractionResult {
        text,
        strategy_used: ExtractionStrategy::Direct,
        fallback_applied,
        extraction_error,
        token_usage: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Minimal PDF with one page per phrase, with correct xref offsets so
    /// both `lopdf` and `pdf-extract` can parse it.
    pub(crate) fn pdf_with_pages(phrases: &[&str]) -> Vec<u8> {
        let n = phrases.len();
        let font_id = 3 + 2 * n;
        let mut objects: Vec<String> = Vec::new();
        objects.push("<< /Type /Catalog /Pages 2 0 R >>".to_string());
        let kids: Vec<String> = (0..n).map(|i| format!("{} 0 R", 3 + 2 * i)).collect();
        objects.push(format!(
            "<< /Type /Pages /Kids [{}] /Count {} >>",
            kids.join(" "),
            n
        ));
        for (i, phrase) in phrases.iter().enumerate() {
            let content_id = 4 + 2 * i;
            objects.push(format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {} 0 R /Resources << /Font << /F1 {} 0 R >> >> >>",
                content_id, font_id
            ));
            let stream = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET", phrase);
            objects.push(format!(
                "<< /Length {} >>\nstream\n{}\nendstream",
                stream.len(),
                stream
            ));
        }
        objects.push("<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string());

        let mut out = Vec::new();
        out.extend_from_slice(b"%PDF-1.4\n");
        let mut offsets = Vec::new();
        for (i, body) in objects.iter().enumerate() {
            offsets.push(out.len());
            out.extend_from_slice(format!("{} 0 obj {} endobj\n", i + 1, body).as_bytes());
        }
        let xref_start = out.len();
        out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
        out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
        for offset in offsets {
            out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
        }
        out.extend_from_slice(
            format!(
                "trailer << /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
                objects.len() + 1,
                xref_start
            )
            .as_bytes(),
        );
        out
    }

    #[test]
    fn direct_decode_accepts_utf8_and_strips_bom() {
        assert_eq!(direct_decode(b"hello").unwrap(), "hello");
        assert_eq!(direct_decode(b"\xEF\xBB\xBFhi").unwrap(), "hi");
        assert_eq!(direct_decode(b"").unwrap(), "");
    }

    #[test]
    fn direct_decode_rejects_invalid_utf8() {
        let err = direct_decode(&[0xff, 0xfe, 0x00, 0x80]).unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[test]
    fn decode_failure_yields_empty_text_with_error() {
        let result = decode_result(&[0xff, 0xff], ContentClass::TextLike, false, None);
        assert_eq!(result.text, "");
        assert!(!result.fallback_applied);
        assert_eq!(result.extraction_error.unwrap().kind, "decode");
    }

    #[test]
    fn fallback_keeps_vision_cause() {
        let cause = PipelineError::ModelRefusal("no".into());
        let result = decode_result(b"plain", ContentClass::ImageLike, true, Some(cause));
        assert_eq!(result.text, "plain");
        assert!(result.fallback_applied);
        assert_eq!(result.strategy_used, ExtractionStrategy::Direct);
        assert_eq!(result.extraction_error.unwrap().kind, "model_refusal");
    }

    #[test]
    fn fallback_decode_reads_pdf_text_layer() {
        let pdf = pdf_with_pages(&["quarterly phrase"]);
        let text = fallback_decode(&pdf, ContentClass::PdfLike).unwrap();
        assert!(text.contains("quarterly phrase"), "got: {:?}", text);
    }

    #[test]
    fn vision_media_types() {
        assert_eq!(
            vision_media_type("application/pdf", "a.pdf", ContentClass::PdfLike).unwrap(),
            (MIME_PDF.to_string(), AttachmentKind::Document)
        );
        assert_eq!(
            vision_media_type("image/PNG", "a", ContentClass::ImageLike).unwrap(),
            ("image/png".to_string(), AttachmentKind::Image)
        );
        assert_eq!(
            vision_media_type("", "scan.jpg", ContentClass::ImageLike).unwrap().0,
            "image/jpeg"
        );
        assert!(vision_media_type("", "scan", ContentClass::ImageLike).is_err());
    }

    #[test]
    fn page_ranges_are_contiguous_and_cover_all() {
        let ranges = page_ranges(5, 2);
        assert_eq!(ranges, vec![0..3, 3..5]);
        let ranges = page_ranges(3, 10);
        assert_eq!(ranges, vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn split_pdf_produces_ordered_loadable_chunks() {
        let pdf = pdf_with_pages(&["one", "two", "three"]);
        let chunks = split_pdf(&pdf, 1_000_000, 16).unwrap();
        assert_eq!(chunks.len(), 2);
        let page_counts: Vec<usize> = chunks
            .iter()
            .map(|c| lopdf::Document::load_mem(c).unwrap().get_pages().len())
            .collect();
        assert_eq!(page_counts, vec![2, 1]);
    }

    #[test]
    fn split_pdf_respects_chunk_limit() {
        let pdf = pdf_with_pages(&["one", "two", "three"]);
        let chunks = split_pdf(&pdf, 1_000_000, 1).unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn split_pdf_with_tiny_cap_is_unsupported() {
        let pdf = pdf_with_pages(&["one", "two"]);
        let err = split_pdf(&pdf, 8, 16).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedContent(_)));
    }

    #[test]
    fn split_pdf_rejects_garbage() {
        let err = split_pdf(b"not a pdf", 4, 16).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedContent(_)));
    }

    /// Answers vision calls from a queue, in call order.
    struct QueuedModel {
        answers: Mutex<VecDeque<Result<String, PipelineError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl QueuedModel {
        fn new(answers: Vec<Result<&str, PipelineError>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into_iter().map(|a| a.map(str::to_string)).collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl GenerativeModel for QueuedModel {
        fn model_id(&self) -> &str {
            "queued"
        }

        async fn invoke(&self, request: &ModelRequest<'_>) -> Result<ModelResponse, PipelineError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            let answer = self.answers.lock().unwrap().pop_front();
            let text = answer.unwrap_or_else(|| Err(PipelineError::Internal("no answer".into())))?;
            Ok(ModelResponse {
                text,
                model_id: "queued".into(),
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 2,
                },
            })
        }
    }

    fn chunking_extractor(model: Arc<QueuedModel>, vision_max_bytes: usize) -> TextExtractor {
        let config: ModelConfig = toml::from_str("model_id = \"queued\"").unwrap();
        let limits = LimitsConfig {
            vision_max_bytes,
            max_vision_chunks: 16,
            summary_excerpt_chars: 8000,
        };
        let policy = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        TextExtractor::new(model, policy, &config, &limits)
    }

    fn pdf_object(bytes: Vec<u8>) -> RawObject {
        RawObject {
            content_length: bytes.len() as u64,
            bytes,
            content_type: MIME_PDF.to_string(),
            last_modified: None,
            etag: None,
            user_metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn failed_chunk_keeps_text_of_extracted_chunks() {
        let pdf = pdf_with_pages(&["alpha", "bravo", "charlie", "delta"]);
        let cap = pdf.len() - 1;
        let model = QueuedModel::new(vec![
            Ok("VISION-CHUNK-1"),
            Err(PipelineError::ModelRefusal("declined".into())),
        ]);
        let extractor = chunking_extractor(model.clone(), cap);

        let result = extractor
            .extract(
                &pdf_object(pdf),
                "scan.pdf",
                ContentClass::PdfLike,
                &Deadline::after(Duration::from_secs(10)),
            )
            .await;

        assert_eq!(result.text, "VISION-CHUNK-1");
        assert_eq!(result.strategy_used, ExtractionStrategy::Vision);
        assert!(!result.fallback_applied);
        assert!(result.is_degraded());
        let failure = result.extraction_error.unwrap();
        assert_eq!(failure.kind, "model_refusal");
        assert!(failure.message.starts_with("part 2 of 2"), "got: {}", failure.message);
        assert_eq!(
            result.token_usage,
            Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 2,
            })
        );

        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].contains("part 1 of 2"));
        assert!(prompts[1].contains("part 2 of 2"));
    }

    #[tokio::test]
    async fn every_chunk_failing_falls_back_to_text_layer() {
        let pdf = pdf_with_pages(&["alpha", "bravo", "charlie", "delta"]);
        let cap = pdf.len() - 1;
        let model = QueuedModel::new(vec![
            Err(PipelineError::ModelRefusal("declined".into())),
            Err(PipelineError::ModelRefusal("declined".into())),
        ]);
        let extractor = chunking_extractor(model, cap);

        let result = extractor
            .extract(
                &pdf_object(pdf),
                "scan.pdf",
                ContentClass::PdfLike,
                &Deadline::after(Duration::from_secs(10)),
            )
            .await;

        assert_eq!(result.strategy_used, ExtractionStrategy::Direct);
        assert!(result.fallback_applied);
        assert!(result.text.contains("alpha"), "got: {:?}", result.text);
        assert_eq!(result.extraction_error.unwrap().kind, "model_refusal");
        assert_eq!(result.token_usage, None);
    }
}
