use crate::config::ServiceConfig;
use crate::types::{AccessError, AccessResult, AnalysisResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};

/// Task prompt sent with every masked crop. The key names are a contract
/// with [`parse_report`] and with stored reports; keep them stable.
pub const OBSTRUCTION_PROMPT: &str = r#"Analyze the entire cropped image for obstructions in fire access ways. The image is cropped and masked to the access way, so do not reason about anything outside the visible area.

Detect obstructions such as vehicles with high accuracy and keep every field logically consistent: if a vehicle is detected it is an obstruction, and if the description mentions a vehicle the "vehicle" field must be true.

Return a report as a single JSON object with exactly these keys:
{
  "obstruction": boolean,            // any obstruction detected
  "sufficient": boolean,             // a fire engine can still pass through
  "sufficient_explanation": "string",
  "permanent": boolean,              // any detected obstruction is permanent
  "permanent_explanation": "string",
  "flammable": boolean,              // any detected obstruction is flammable
  "flammable_explanation": "string",
  "vehicle": boolean,                // any detected obstruction is a vehicle
  "vehicle_explanation": "string",
  "label": "string",                 // comma-separated obstruction types
  "description": "string",           // concise summary of the obstructions
  "actions": "string"                // recommended actions to clear the way
}

Return only the JSON object. Booleans must be lowercase true/false and every string must be double quoted."#;

/// External vision model: takes an encoded image and a prompt, returns free text
pub trait VisionModel: Send + Sync {
    fn submit(&self, image: &[u8], prompt: &str) -> AccessResult<String>;
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

/// Client for an Ollama-compatible `/api/generate` endpoint
pub struct OllamaClient {
    client: reqwest::blocking::Client,
    url: String,
    model: String,
    temperature: f64,
}

impl OllamaClient {
    pub fn new(url: impl Into<String>, model: impl Into<String>, temperature: f64) -> AccessResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(600)) // large crops on CPU inference are slow
            .user_agent("Blockfinder")
            .build()
            .map_err(|e| AccessError::ModelRequest(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            model: model.into(),
            temperature,
        })
    }

    pub fn from_config(config: &ServiceConfig) -> AccessResult<Self> {
        Self::new(&config.model_url, &config.model_name, config.model_temperature)
    }
}

impl VisionModel for OllamaClient {
    fn submit(&self, image: &[u8], prompt: &str) -> AccessResult<String> {
        let start = Instant::now();
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "format": "json",
            "options": { "temperature": self.temperature },
            "images": [BASE64.encode(image)],
        });

        log::debug!("Submitting {} byte image to {} ({})", image.len(), self.url, self.model);
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .map_err(|e| AccessError::ModelRequest(format!("Request to {} failed: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(AccessError::ModelRequest(format!(
                "HTTP {} from {}: {}",
                status.as_u16(),
                self.url,
                body.chars().take(200).collect::<String>()
            )));
        }

        let body: GenerateResponse = response
            .json()
            .map_err(|e| AccessError::ModelResponse(format!("Unreadable model reply: {}", e)))?;
        log::info!("Model answered in {:.2}s", start.elapsed().as_secs_f64());

        body.response
            .ok_or_else(|| AccessError::ModelResponse("Model reply has no 'response' field".to_string()))
    }
}

/// Submit a masked crop with the obstruction prompt and parse the report
pub fn analyze(model: &dyn VisionModel, image: &[u8]) -> AccessResult<AnalysisResult> {
    let text = model.submit(image, OBSTRUCTION_PROMPT)?;
    parse_report(&text)
}

/// Opening braces tried as object starts before giving up
const MAX_OBJECT_STARTS: usize = 64;

/// First substring of `text` that is a balanced, parseable JSON object.
///
/// Braces inside string literals (including escaped quotes) do not count
/// towards nesting. When a balanced candidate fails to parse, scanning
/// resumes at the next `{`, up to [`MAX_OBJECT_STARTS`] starts.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let starts = bytes
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'{')
        .map(|(i, _)| i)
        .take(MAX_OBJECT_STARTS);

    for start in starts {
        let Some(end) = balanced_end(bytes, start) else {
            continue;
        };
        let candidate = &text[start..=end];
        if matches!(serde_json::from_str::<Value>(candidate), Ok(Value::Object(_))) {
            return Some(candidate);
        }
    }
    None
}

fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match (escaped, *b) {
                (true, _) => escaped = false,
                (false, b'\\') => escaped = true,
                (false, b'"') => in_string = false,
                _ => {}
            }
            continue;
        }
        match *b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Map a free-text model answer onto [`AnalysisResult`].
/// Missing or mistyped keys take their default; only the absence of any JSON object is an error.
pub fn parse_report(text: &str) -> AccessResult<AnalysisResult> {
    let object = extract_json_object(text).ok_or_else(|| {
        AccessError::ModelResponse(format!(
            "No JSON object in model answer: {:?}",
            text.chars().take(120).collect::<String>()
        ))
    })?;

    let Value::Object(map) = serde_json::from_str::<Value>(object)? else {
        return Err(AccessError::ModelResponse("Model answer is not a JSON object".to_string()));
    };

    Ok(AnalysisResult {
        obstruction_present: flag(&map, "obstruction"),
        sufficient_clearance: flag(&map, "sufficient"),
        sufficient_explanation: text_field(&map, "sufficient_explanation"),
        is_permanent: flag(&map, "permanent"),
        permanent_explanation: text_field(&map, "permanent_explanation"),
        is_flammable: flag(&map, "flammable"),
        flammable_explanation: text_field(&map, "flammable_explanation"),
        is_vehicle: flag(&map, "vehicle"),
        vehicle_explanation: text_field(&map, "vehicle_explanation"),
        label: text_field(&map, "label"),
        description: text_field(&map, "description"),
        recommended_actions: text_field(&map, "actions"),
    })
}

fn flag(map: &Map<String, Value>, key: &str) -> bool {
    match map.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn text_field(map: &Map<String, Value>, key: &str) -> String {
    match map.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn test_extracts_object_from_prose() {
        let text = "Sure! Here is the report:\n{\"obstruction\": true, \"label\": \"car\"}\nLet me know.";
        assert_eq!(extract_json_object(text), Some("{\"obstruction\": true, \"label\": \"car\"}"));
    }

    #[test]
    fn test_nested_objects_are_not_truncated() {
        let text = r#"report {"obstruction": true, "details": {"count": 2}, "label": "van"} done"#;
        let object = extract_json_object(text).unwrap();
        assert!(object.ends_with(r#""label": "van"}"#));
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let text = r#"{"description": "a sign reading \"}{\" blocks the lane", "obstruction": true}"#;
        assert_eq!(extract_json_object(text), Some(text));
        assert!(parse_report(text).unwrap().obstruction_present);
    }

    #[test]
    fn test_runaway_braces_are_bounded() {
        let start = std::time::Instant::now();
        let text = "{".repeat(200_000);
        assert_eq!(extract_json_object(&text), None);
        assert!(start.elapsed() < std::time::Duration::from_secs(5));

        // past the start limit an object is no longer looked for
        let text = format!("{}{{\"obstruction\": true}}", "{x} ".repeat(MAX_OBJECT_STARTS));
        assert_eq!(extract_json_object(&text), None);
        let text = format!("{}{{\"obstruction\": true}}", "{x} ".repeat(MAX_OBJECT_STARTS - 1));
        assert_eq!(extract_json_object(&text), Some("{\"obstruction\": true}"));
    }

    #[test]
    fn test_skips_unparseable_candidates() {
        let text = r#"{placeholder} then {"obstruction": false, "sufficient": true}"#;
        let report = parse_report(text).unwrap();
        assert!(!report.obstruction_present);
        assert!(report.sufficient_clearance);
    }

    #[test]
    fn test_no_object_is_model_response_error() {
        for text in ["no json here", "{ unbalanced", "[1, 2, 3]", ""] {
            assert!(matches!(parse_report(text), Err(AccessError::ModelResponse(_))), "{}", text);
        }
    }

    #[test]
    fn test_key_mapping_and_defaults() {
        let text = r#"{
            "obstruction": "true",
            "permanent": 1,
            "vehicle": true,
            "vehicle_explanation": " A parked lorry ",
            "label": ["lorry", "bins"],
            "actions": "Tow the lorry"
        }"#;
        let report = parse_report(text).unwrap();
        assert!(report.obstruction_present);
        assert!(!report.is_permanent);
        assert!(report.is_vehicle);
        assert_eq!(report.vehicle_explanation, "A parked lorry");
        assert_eq!(report.label, "lorry, bins");
        assert_eq!(report.recommended_actions, "Tow the lorry");
        assert_eq!(report.description, "");
        assert!(!report.sufficient_clearance);
    }

    struct CannedModel(&'static str);

    impl VisionModel for CannedModel {
        fn submit(&self, _image: &[u8], prompt: &str) -> AccessResult<String> {
            assert_eq!(prompt, OBSTRUCTION_PROMPT);
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn test_analyze_uses_fixed_prompt() {
        let report = analyze(&CannedModel(r#"{"obstruction": true, "permanent": true}"#), b"jpeg").unwrap();
        assert!(report.obstruction_present && report.is_permanent);
    }

    fn serve_once(status: &'static str, body: &'static str) -> (String, std::thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/api/generate", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + length {
                        break;
                    }
                }
            }
            let reply = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(reply.as_bytes()).unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (url, handle)
    }

    #[test]
    fn test_ollama_client_payload_and_reply() {
        let (url, server) = serve_once("200 OK", r#"{"model":"llava:7b","response":"{\"obstruction\": true}","done":true}"#);
        let client = OllamaClient::new(url, "llava:7b", 0.1).unwrap();

        let text = client.submit(&[1, 2, 3], "prompt text").unwrap();
        assert_eq!(text, r#"{"obstruction": true}"#);

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /api/generate"));
        assert!(request.contains(r#""format":"json""#));
        assert!(request.contains(r#""stream":false"#));
        assert!(request.contains(r#""images":["AQID"]"#));
    }

    #[test]
    fn test_ollama_http_error_is_request_error() {
        let (url, server) = serve_once("500 Internal Server Error", r#"{"error":"model not loaded"}"#);
        let client = OllamaClient::new(url, "llava:7b", 0.1).unwrap();
        let result = client.submit(&[0], "p");
        assert!(matches!(result, Err(AccessError::ModelRequest(_))));
        assert!(!result.unwrap_err().is_fatal());
        server.join().unwrap();
    }
}
