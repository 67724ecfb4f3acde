use reqwest::header::HeaderMap;
use reqwest::StatusCode;

use crate::error::PipelineError;

/// Decode the upstream rate-limit headers into a wait duration in
/// milliseconds.
///
/// The API advertises its concurrent rules in `x-rate-limit-rules`; each
/// named rule `R` carries a colon-delimited `maxHits:periodSeconds:...`
/// policy in `x-rate-limit-R`. The binding interval is the slowest one, i.e.
/// the maximum of `periodSeconds * 1000 / maxHits` over all rules, clamped
/// up by `Retry-After` when the request was rejected with 429.
pub fn decode_wait_ms(status: StatusCode, headers: &HeaderMap) -> Result<u64, PipelineError> {
    let mut wait_ms: u64 = 0;

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_s: u64 = header_str(headers, "Retry-After")?
            .ok_or_else(|| PipelineError::Decode("429 response without Retry-After".to_string()))?
            .trim()
            .parse()
            .map_err(|_| PipelineError::Decode("malformed Retry-After header".to_string()))?;
        wait_ms = retry_s * 1000;
    }

    let rules = match header_str(headers, "x-rate-limit-rules")? {
        Some(rules) if !rules.trim().is_empty() => rules,
        _ => return Ok(wait_ms),
    };

    for rule in rules.split(',') {
        let rule = rule.trim();
        if rule.is_empty() {
            continue;
        }

        let header = format!("x-rate-limit-{rule}");
        let policy = header_str(headers, &header)?.ok_or_else(|| {
            PipelineError::Decode(format!("rule {rule} declared but {header} is missing"))
        })?;

        let mut fields = policy.split(':');
        let max_hits = parse_policy_field(fields.next(), rule)?;
        let period_s = parse_policy_field(fields.next(), rule)?;
        if max_hits == 0 {
            return Err(PipelineError::Decode(format!(
                "rule {rule} allows zero hits per period"
            )));
        }

        wait_ms = wait_ms.max(period_s * 1000 / max_hits);
    }

    Ok(wait_ms)
}

fn parse_policy_field(field: Option<&str>, rule: &str) -> Result<u64, PipelineError> {
    field
        .and_then(|f| f.trim().parse().ok())
        .ok_or_else(|| PipelineError::Decode(format!("malformed policy for rule {rule}")))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, PipelineError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(Some)
            .map_err(|_| PipelineError::Decode(format!("header {name} is not valid ASCII"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_slowest_rule_wins() {
        let headers = headers(&[
            ("x-rate-limit-rules", "a,b"),
            ("x-rate-limit-a", "10:30:0"),
            ("x-rate-limit-b", "3:60:0"),
        ]);
        assert_eq!(decode_wait_ms(StatusCode::OK, &headers).unwrap(), 20_000);
    }

    #[test]
    fn test_no_rules_means_no_wait() {
        assert_eq!(
            decode_wait_ms(StatusCode::OK, &HeaderMap::new()).unwrap(),
            0
        );
    }

    #[test]
    fn test_retry_after_clamps_up() {
        let headers = headers(&[
            ("Retry-After", "30"),
            ("x-rate-limit-rules", "ip"),
            ("x-rate-limit-ip", "2:10:0"),
        ]);
        assert_eq!(
            decode_wait_ms(StatusCode::TOO_MANY_REQUESTS, &headers).unwrap(),
            30_000
        );
    }

    #[test]
    fn test_rule_can_exceed_retry_after() {
        let headers = headers(&[
            ("Retry-After", "1"),
            ("x-rate-limit-rules", "ip"),
            ("x-rate-limit-ip", "1:60:0"),
        ]);
        assert_eq!(
            decode_wait_ms(StatusCode::TOO_MANY_REQUESTS, &headers).unwrap(),
            60_000
        );
    }

    #[test]
    fn test_declared_rule_without_policy_fails() {
        let headers = headers(&[("x-rate-limit-rules", "ip")]);
        assert!(matches!(
            decode_wait_ms(StatusCode::OK, &headers),
            Err(PipelineError::Decode(_))
        ));
    }

    #[test]
    fn test_malformed_policy_fails() {
        let headers = headers(&[
            ("x-rate-limit-rules", "ip"),
            ("x-rate-limit-ip", "banana:60:0"),
        ]);
        assert!(matches!(
            decode_wait_ms(StatusCode::OK, &headers),
            Err(PipelineError::Decode(_))
        ));
    }

    #[test]
    fn test_missing_retry_after_on_429_fails() {
        assert!(matches!(
            decode_wait_ms(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new()),
            Err(PipelineError::Decode(_))
        ));
    }
}
