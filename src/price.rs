use once_cell::sync::Lazy;
use regex::Regex;

static PRICE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^~price (.+)$").expect("valid regex"));

/// A listing price as written by the seller: an amount and a short currency
/// identifier, e.g. `5 chaos` or `3 divine`.
#[derive(Debug, Clone, PartialEq)]
pub struct Price {
    pub amount: f64,
    pub currency: String,
}

/// Parse a `~price <amount> <currency>` note. Returns `None` on anything
/// else; most listings carry no price at all.
pub fn parse_price(note: &str) -> Option<Price> {
    let tail = PRICE_RE.captures(note)?.get(1)?.as_str();

    let mut parts = tail.split(' ');
    let amount = parts.next()?;
    let currency = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let amount: f64 = amount.parse().ok()?;
    if !amount.is_finite() || amount < 0.0 {
        return None;
    }

    Some(Price {
        amount,
        currency: currency.trim().to_string(),
    })
}

/// Resolve an item's price from its note, falling back to the stash tab
/// name. A price on the item shadows one set on the whole tab.
pub fn find_price(note: &str, stash_name: &str) -> Option<Price> {
    parse_price(note).or_else(|| parse_price(stash_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_price() {
        let price = parse_price("~price 5 chaos").unwrap();
        assert_eq!(price.amount, 5.0);
        assert_eq!(price.currency, "chaos");
    }

    #[test]
    fn test_parse_fractional_amount() {
        let price = parse_price("~price 2.5 divine").unwrap();
        assert_eq!(price.amount, 2.5);
        assert_eq!(price.currency, "divine");
    }

    #[test]
    fn test_rejects_wrong_cardinality() {
        assert!(parse_price("~price 5").is_none());
        assert!(parse_price("~price 5 chaos orb").is_none());
        assert!(parse_price("~price 5  chaos").is_none());
    }

    #[test]
    fn test_rejects_non_price_notes() {
        assert!(parse_price("").is_none());
        assert!(parse_price("~b/o 5 chaos").is_none());
        assert!(parse_price("price 5 chaos").is_none());
    }

    #[test]
    fn test_rejects_bad_amounts() {
        assert!(parse_price("~price -1 chaos").is_none());
        assert!(parse_price("~price NaN chaos").is_none());
        assert!(parse_price("~price inf chaos").is_none());
        assert!(parse_price("~price five chaos").is_none());
    }

    #[test]
    fn test_tab_name_fallback() {
        let price = find_price("", "~price 3 divine").unwrap();
        assert_eq!(price.amount, 3.0);
        assert_eq!(price.currency, "divine");
    }

    #[test]
    fn test_item_note_shadows_tab_name() {
        let price = find_price("~price 7 chaos", "~price 3 divine").unwrap();
        assert_eq!(price.amount, 7.0);
        assert_eq!(price.currency, "chaos");
    }
}
