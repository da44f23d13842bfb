//! Mock automation driver for integration testing
//!
//! Speaks the driver wire protocol on stdio against a small scripted editor
//! scene, so the engine can be exercised without a real VS Code.
//!
//! Scene selectors:
//! - `.monaco-editor`: typing appends to its text and marks the tab dirty
//! - `.tab.active`: active tab, text `basic.txt`
//! - `.tab.active.dirty`: present while there are unsaved edits; `Control+S` saves
//! - `.slow`: reports "not yet rendered" for the first few requests
//! - `.hang`: requests against it are never answered
//! - `.broken`: every request fails permanently

use base64::Engine;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};

/// 1x1 PNG
const PIXEL_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

fn main() {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = stdout.lock();

    let slow_attempts = std::env::var("UXTEST_MOCK_SLOW_ATTEMPTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);
    let mut scene = Scene::new(slow_attempts);

    loop {
        // Read Content-Length header
        let mut header_line = String::new();
        if reader.read_line(&mut header_line).unwrap_or(0) == 0 {
            break; // EOF
        }

        if !header_line.starts_with("Content-Length:") {
            continue;
        }

        let content_length: usize = header_line
            .trim_start_matches("Content-Length:")
            .trim()
            .parse()
            .unwrap_or(0);

        // Read empty line
        let mut empty_line = String::new();
        reader.read_line(&mut empty_line).ok();

        let mut body = vec![0u8; content_length];
        if reader.read_exact(&mut body).is_err() {
            break;
        }

        let message: Value = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(_) => continue,
        };

        let command = message["command"].as_str().unwrap_or("").to_string();
        for reply in scene.handle(&message) {
            send_message(&mut writer, &reply);
        }
        if command == "shutdown" {
            break;
        }
    }
}

fn send_message<W: Write>(writer: &mut W, message: &Value) {
    let body = serde_json::to_string(message).unwrap();
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).ok();
    writer.write_all(body.as_bytes()).ok();
    writer.flush().ok();
}

#[derive(Clone)]
struct Element {
    count: usize,
    visible: bool,
    text: String,
}

enum Outcome {
    Ok(Value),
    Transient(String),
    Failed(String),
    /// Never answer
    Hang,
}

struct Scene {
    elements: HashMap<String, Element>,
    slow_attempts: u32,
    attempts: HashMap<String, u32>,
}

impl Scene {
    fn new(slow_attempts: u32) -> Self {
        let mut elements = HashMap::new();
        let mut add = |selector: &str, count: usize, visible: bool, text: &str| {
            elements.insert(
                selector.to_string(),
                Element {
                    count,
                    visible,
                    text: text.to_string(),
                },
            );
        };
        add(".monaco-editor", 1, true, "");
        add(".tab.active", 1, true, "basic.txt");
        add(".tab.active.dirty", 0, false, "");
        add(".slow", 1, true, "ready");
        add(".broken", 1, true, "");

        Self {
            elements,
            slow_attempts,
            attempts: HashMap::new(),
        }
    }

    fn handle(&mut self, request: &Value) -> Vec<Value> {
        let seq = request["seq"].as_i64().unwrap_or(0);
        let command = request["command"].as_str().unwrap_or("");
        let args = &request["arguments"];

        let outcome = match command {
            "initialize" => {
                let ready = json!({
                    "type": "event",
                    "event": "ready",
                    "body": { "cdpPort": args["cdpPort"] }
                });
                return vec![
                    response(seq, command, Outcome::Ok(json!({ "capabilities": ["perform", "waitFor", "inspect", "screenshot"] }))),
                    ready,
                ];
            }
            "perform" => self.perform(args),
            "waitFor" => self.wait_for(args),
            "inspect" => self.inspect(args),
            "screenshot" => Outcome::Ok(json!({
                "data": base64::engine::general_purpose::STANDARD.encode(PIXEL_PNG)
            })),
            "shutdown" => Outcome::Ok(Value::Null),
            other => Outcome::Failed(format!("unknown command '{}'", other)),
        };

        match outcome {
            Outcome::Hang => Vec::new(),
            outcome => vec![response(seq, command, outcome)],
        }
    }

    /// Common gatekeeping for requests against a target
    fn reach(&mut self, args: &Value) -> Result<Option<String>, Outcome> {
        let target = &args["target"];
        let key = target["selector"]
            .as_str()
            .or_else(|| target["description"].as_str())
            .map(String::from);
        let Some(key) = key else {
            return Ok(None);
        };

        if key == ".hang" {
            return Err(Outcome::Hang);
        }
        if key == ".broken" {
            return Err(Outcome::Failed("element is detached from the DOM".to_string()));
        }
        if key == ".slow" {
            let seen = self.attempts.entry(key.clone()).or_insert(0);
            *seen += 1;
            if *seen <= self.slow_attempts {
                return Err(Outcome::Transient("not yet rendered".to_string()));
            }
        }
        Ok(Some(key))
    }

    fn perform(&mut self, args: &Value) -> Outcome {
        let target = match self.reach(args) {
            Ok(target) => target,
            Err(outcome) => return outcome,
        };
        if let Some(key) = &target {
            if self.elements.get(key).map(|e| e.count).unwrap_or(0) == 0 {
                return Outcome::Failed(format!("no element matches '{}'", key));
            }
        }

        match args["action"].as_str().unwrap_or("") {
            "type" => {
                let text = args["text"].as_str().unwrap_or("");
                if let Some(editor) = self.elements.get_mut(".monaco-editor") {
                    editor.text.push_str(text);
                }
                if let Some(dirty) = self.elements.get_mut(".tab.active.dirty") {
                    dirty.count = 1;
                    dirty.visible = true;
                }
            }
            "press" if args["key"].as_str() == Some("Control+S") => {
                if let Some(dirty) = self.elements.get_mut(".tab.active.dirty") {
                    dirty.count = 0;
                    dirty.visible = false;
                }
            }
            _ => {}
        }
        Outcome::Ok(Value::Null)
    }

    fn wait_for(&mut self, args: &Value) -> Outcome {
        let key = match self.reach(args) {
            Ok(Some(key)) => key,
            Ok(None) => return Outcome::Failed("waitFor needs a target".to_string()),
            Err(outcome) => return outcome,
        };
        let shown = self
            .elements
            .get(&key)
            .map(|e| e.count > 0 && e.visible)
            .unwrap_or(false);
        let want_visible = args["state"].as_str() != Some("hidden");
        if shown == want_visible {
            Outcome::Ok(Value::Null)
        } else {
            Outcome::Failed(format!(
                "'{}' did not become {}",
                key,
                args["state"].as_str().unwrap_or("visible")
            ))
        }
    }

    fn inspect(&mut self, args: &Value) -> Outcome {
        let key = match self.reach(args) {
            Ok(Some(key)) => key,
            Ok(None) => return Outcome::Failed("inspect needs a target".to_string()),
            Err(outcome) => return outcome,
        };
        let element = self.elements.get(&key).cloned().unwrap_or(Element {
            count: 0,
            visible: false,
            text: String::new(),
        });
        Outcome::Ok(json!({
            "count": element.count,
            "visible": element.visible,
            "text": element.text,
        }))
    }
}

fn response(seq: i64, command: &str, outcome: Outcome) -> Value {
    match outcome {
        Outcome::Ok(body) => json!({
            "type": "response",
            "request_seq": seq,
            "command": command,
            "success": true,
            "body": body,
        }),
        Outcome::Transient(message) => json!({
            "type": "response",
            "request_seq": seq,
            "command": command,
            "success": false,
            "transient": true,
            "message": message,
        }),
        Outcome::Failed(message) => json!({
            "type": "response",
            "request_seq": seq,
            "command": command,
            "success": false,
            "message": message,
        }),
        Outcome::Hang => Value::Null,
    }
}
