//! Key naming helpers.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Upper,
    Lower,
    Digit,
    Separator,
}

/// Converts a type name into the kebab-case form used in Redis keys.
///
/// `OrderSaga` becomes `order-saga`, `HTTPRequestSaga` becomes
/// `http-request-saga` and `order_saga` becomes `order-saga`. Characters that
/// are neither letters, digits nor `-` act as word separators and are dropped.
pub fn to_kebab_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + name.len() / 5);
    let mut previous: Option<CharClass> = None;

    for (index, &current) in chars.iter().enumerate() {
        if current == '-' {
            out.push('-');
            previous = None;
            continue;
        }

        let class = if current.is_uppercase() {
            CharClass::Upper
        } else if current.is_lowercase() {
            CharClass::Lower
        } else if current.is_numeric() {
            CharClass::Digit
        } else {
            if previous.is_some() {
                previous = Some(CharClass::Separator);
            }
            continue;
        };

        match class {
            CharClass::Upper => {
                let after_word = matches!(
                    previous,
                    Some(CharClass::Separator) | Some(CharClass::Lower)
                );
                let starts_word = previous.is_some()
                    && previous != Some(CharClass::Digit)
                    && chars.get(index + 1).is_some_and(|next| next.is_lowercase());
                if after_word || starts_word {
                    out.push('-');
                }
                out.extend(current.to_lowercase());
            }
            _ => {
                if previous == Some(CharClass::Separator) {
                    out.push('-');
                }
                out.push(current);
            }
        }

        previous = Some(class);
    }

    out
}
