pub fn parse_form(body: &str) -> Vec<(String, String)> {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(name), decode_component(value))
        })
        .collect()
}

pub fn form_value(body: &str, key: &str) -> Option<String> {
    parse_form(body)
        .into_iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value)
}

fn decode_component(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => decoded.push(b' '),
            b'%' => {
                let escaped = bytes
                    .get(i + 1..i + 3)
                    .and_then(|pair| hex_pair(pair[0], pair[1]));
                match escaped {
                    Some(byte) => {
                        decoded.push(byte);
                        i += 2;
                    }
                    None => decoded.push(b'%'),
                }
            }
            other => decoded.push(other),
        }
        i += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_pair(high: u8, low: u8) -> Option<u8> {
    let high = (high as char).to_digit(16)?;
    let low = (low as char).to_digit(16)?;
    Some((high * 16 + low) as u8)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn decodes_plus_and_percent_escapes() {
        let pairs = parse_form("ssid=My+Home%20Net&pass=p%26ss%3Dw0rd");
        assert_eq!(
            pairs,
            vec![
                ("ssid".to_string(), "My Home Net".to_string()),
                ("pass".to_string(), "p&ss=w0rd".to_string()),
            ]
        );
    }

    #[test]
    fn keeps_invalid_escapes_verbatim() {
        assert_eq!(form_value("v=100%&w=%zz", "v").as_deref(), Some("100%"));
        assert_eq!(form_value("v=100%&w=%zz", "w").as_deref(), Some("%zz"));
    }

    #[test]
    fn missing_value_is_empty() {
        assert_eq!(form_value("flag&x=1", "flag").as_deref(), Some(""));
        assert_eq!(form_value("x=1", "y"), None);
    }
}
