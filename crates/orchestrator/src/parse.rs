use regex::Regex;
use tenex_domain::model::RoutingDecision;

/// Extract a `RoutingDecision` from an LLM completion that may wrap its
/// JSON in a fenced code block (` ```json ... ``` `), plain fences
/// (` ``` ... ``` `), or emit bare JSON with surrounding prose.
pub fn parse_routing_decision(raw: &str) -> Result<RoutingDecision, ParseError> {
    let candidate = extract_json_candidate(raw).ok_or(ParseError::NoJsonFound)?;
    serde_json::from_str(&candidate).map_err(|e| ParseError::Malformed(e.to_string()))
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("no JSON object found in orchestrator output")]
    NoJsonFound,
    #[error("malformed routing decision: {0}")]
    Malformed(String),
}

fn extract_json_candidate(raw: &str) -> Option<String> {
    let fence = Regex::new(r"```(?:json)?\s*([\s\S]*?)```").unwrap();
    if let Some(caps) = fence.captures(raw) {
        return Some(caps[1].trim().to_string());
    }
    // Fall back to the first balanced `{...}` span in the text.
    let start = raw.find('{')?;
    let mut depth = 0i32;
    for (offset, ch) in raw[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(raw[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json() {
        let raw = "Here is my decision:\n```json\n{\"agents\":[\"executor\"],\"phase\":\"execute\",\"reason\":\"go\"}\n```\n";
        let decision = parse_routing_decision(raw).unwrap();
        assert_eq!(decision.agents, vec!["executor"]);
    }

    #[test]
    fn parses_bare_fence_without_json_tag() {
        let raw = "```\n{\"agents\":[\"END\"],\"reason\":\"done\"}\n```";
        let decision = parse_routing_decision(raw).unwrap();
        assert!(decision.is_end());
    }

    #[test]
    fn parses_bare_json_with_surrounding_prose() {
        let raw = "I think we should route: {\"agents\":[\"planner\"],\"phase\":\"plan\",\"reason\":\"complex\"} — done.";
        let decision = parse_routing_decision(raw).unwrap();
        assert_eq!(decision.agents, vec!["planner"]);
    }

    #[test]
    fn no_json_is_an_error() {
        let raw = "I'm not sure what to do here.";
        assert!(matches!(parse_routing_decision(raw), Err(ParseError::NoJsonFound)));
    }

    #[test]
    fn malformed_json_is_an_error() {
        let raw = "```json\n{\"agents\": [\"executor\"\n```";
        assert!(matches!(
            parse_routing_decision(raw),
            Err(ParseError::Malformed(_))
        ));
    }
}
