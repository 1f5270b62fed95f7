//! Price token extraction
//!
//! Pulls price-like numbers out of raw OCR text ("1.99", "€2,49", "$1,299.00").

use serde::Serialize;

const CURRENCY_SYMBOLS: [char; 5] = ['$', '€', '£', '¥', '₹'];

/// ISO codes accepted directly in front of the amount ("EUR1.99")
const CURRENCY_CODES: [&str; 6] = ["EUR", "USD", "GBP", "CHF", "JPY", "INR"];

/// Longest integer part accepted without a currency symbol; longer runs are
/// usually barcodes or article numbers
const MAX_BARE_INTEGER_DIGITS: usize = 6;

/// A price found in text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceToken {
    /// Token as it appears in the text
    pub text: String,
    /// Normalized form: digits with an optional `.` decimal part
    pub value: String,
    pub amount: f64,
}

fn is_currency(c: char) -> bool {
    CURRENCY_SYMBOLS.contains(&c)
}

/// Count ASCII digits starting at `from`
fn digit_run(chars: &[(usize, char)], from: usize) -> usize {
    chars[from.min(chars.len())..]
        .iter()
        .take_while(|(_, c)| c.is_ascii_digit())
        .count()
}

/// Length of a currency code starting at `from`, or 0
fn currency_code_len(chars: &[(usize, char)], from: usize) -> usize {
    let Some(window) = chars.get(from..from + 3) else {
        return 0;
    };
    let code: String = window.iter().map(|(_, c)| c).collect();
    if CURRENCY_CODES.contains(&code.as_str()) {
        3
    } else {
        0
    }
}

/// Index just past the number starting at `from`, separators included
fn skip_number(chars: &[(usize, char)], from: usize) -> usize {
    let mut j = from;
    loop {
        j += digit_run(chars, j);
        if j < chars.len() && matches!(chars[j].1, '.' | ',') && digit_run(chars, j + 1) > 0 {
            j += 1;
        } else {
            return j;
        }
    }
}

/// Extract price tokens in reading order
pub fn extract_prices(text: &str) -> Vec<PriceToken> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let starts_word = i == 0 || !chars[i - 1].1.is_alphanumeric();
        let prefix = if is_currency(chars[i].1) {
            1
        } else if starts_word {
            currency_code_len(&chars, i)
        } else {
            0
        };
        let leading_symbol = prefix > 0;
        let digits_at = i + prefix;

        if digit_run(&chars, digits_at) == 0 {
            i += 1;
            continue;
        }
        // Digits glued to a word ("kg2.49", "SKU4711") are not prices
        if !leading_symbol && !starts_word {
            i = skip_number(&chars, i);
            continue;
        }

        let mut j = digits_at;
        let mut integer = String::new();
        let mut decimals = String::new();

        let run = digit_run(&chars, j);
        integer.extend(chars[j..j + run].iter().map(|(_, c)| c));
        j += run;

        // Thousands groups ("1,299" / "1.299") followed by an optional decimal part
        while j < chars.len() && matches!(chars[j].1, '.' | ',') {
            let run = digit_run(&chars, j + 1);
            match run {
                3 => {
                    integer.extend(chars[j + 1..j + 4].iter().map(|(_, c)| c));
                    j += 4;
                }
                1 | 2 => {
                    decimals.extend(chars[j + 1..j + 1 + run].iter().map(|(_, c)| c));
                    j += 1 + run;
                    break;
                }
                _ => break,
            }
        }

        let trailing_symbol = j < chars.len() && is_currency(chars[j].1);
        if trailing_symbol {
            j += 1;
        }

        let has_symbol = leading_symbol || trailing_symbol;
        if !has_symbol && integer.len() > MAX_BARE_INTEGER_DIGITS {
            i = j;
            continue;
        }

        let value = if decimals.is_empty() {
            integer
        } else {
            format!("{}.{}", integer, decimals)
        };

        if let Ok(amount) = value.parse::<f64>() {
            let start = chars[i].0;
            let end = chars.get(j).map(|(idx, _)| *idx).unwrap_or(text.len());
            tokens.push(PriceToken {
                text: text[start..end].to_string(),
                value,
                amount,
            });
        }

        i = j.max(i + 1);
    }

    tokens
}

/// First price in the text, normalized
pub fn first_price(text: &str) -> Option<String> {
    extract_prices(text).into_iter().next().map(|t| t.value)
}
