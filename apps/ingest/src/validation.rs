use serde_json::{Map, Value};

/// Decoded, not yet validated callback body.
pub type RawFields = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Normalized `/page_callback` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCallback {
    pub uri: String,
    pub html: String,
}

/// Normalized `/js_callback` body. Every field is present after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsCallback {
    pub uri: String,
    pub cookies: String,
    pub referrer: String,
    pub user_agent: String,
    /// Digits only; parsed by [`JsCallback::browser_timestamp`].
    pub browser_time: String,
    pub probe_uid: String,
    pub origin: String,
    pub injection_key: String,
    pub title: String,
    pub text: String,
    /// Either `"true"` or `"false"`.
    pub was_iframe: String,
    pub dom: String,
}

impl JsCallback {
    pub fn browser_timestamp(&self) -> i64 {
        // Range was checked during validation.
        self.browser_time.parse().unwrap_or_default()
    }

    pub fn was_iframe(&self) -> bool {
        self.was_iframe == "true"
    }
}

pub fn validate_page_callback(fields: &RawFields) -> Result<PageCallback, ValidationError> {
    Ok(PageCallback {
        uri: string_field(fields, "uri", "")?,
        html: string_field(fields, "html", "")?,
    })
}

pub fn validate_js_callback(fields: &RawFields) -> Result<JsCallback, ValidationError> {
    let browser_time = string_field(fields, "browser-time", "0")?;
    if browser_time.is_empty() || !browser_time.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(ValidationError::new(
            "browser-time",
            "must match pattern ^\\d+$",
        ));
    }
    if browser_time.parse::<i64>().is_err() {
        return Err(ValidationError::new(
            "browser-time",
            "must fit in a signed 64-bit integer",
        ));
    }

    let was_iframe = string_field(fields, "was_iframe", "false")?;
    if was_iframe != "true" && was_iframe != "false" {
        return Err(ValidationError::new(
            "was_iframe",
            "must be one of: true, false",
        ));
    }

    Ok(JsCallback {
        uri: string_field(fields, "uri", "")?,
        cookies: string_field(fields, "cookies", "")?,
        referrer: string_field(fields, "referrer", "")?,
        user_agent: string_field(fields, "user-agent", "")?,
        browser_time,
        probe_uid: string_field(fields, "probe-uid", "")?,
        origin: string_field(fields, "origin", "")?,
        injection_key: string_field(fields, "injection_key", "")?,
        title: string_field(fields, "title", "")?,
        text: string_field(fields, "text", "")?,
        was_iframe,
        dom: string_field(fields, "dom", "")?,
    })
}

fn string_field(
    fields: &RawFields,
    name: &'static str,
    default: &str,
) -> Result<String, ValidationError> {
    match fields.get(name) {
        None => Ok(default.to_string()),
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(ValidationError::new(name, "must be string")),
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::{QuickCheck, TestResult};
    use serde_json::json;

    use super::*;

    fn fields(value: Value) -> RawFields {
        match value {
            Value::Object(map) => map,
            _ => panic!("test fixture must be an object"),
        }
    }

    #[test]
    fn empty_js_callback_gets_defaults() {
        let callback = validate_js_callback(&RawFields::new()).expect("valid");
        assert_eq!(callback.browser_time, "0");
        assert_eq!(callback.was_iframe, "false");
        assert_eq!(callback.browser_timestamp(), 0);
        assert!(!callback.was_iframe());
        assert_eq!(callback.uri, "");
        assert_eq!(callback.dom, "");
        assert_eq!(callback.injection_key, "");
    }

    #[test]
    fn js_callback_maps_hyphenated_fields() {
        let callback = validate_js_callback(&fields(json!({
            "uri": "https://victim.test/a",
            "user-agent": "Mozilla/5.0",
            "browser-time": "1700000000000",
            "probe-uid": "probe-1",
            "was_iframe": "true",
            "unknown": 7
        })))
        .expect("valid");
        assert_eq!(callback.user_agent, "Mozilla/5.0");
        assert_eq!(callback.probe_uid, "probe-1");
        assert_eq!(callback.browser_timestamp(), 1_700_000_000_000);
        assert!(callback.was_iframe());
    }

    #[test]
    fn rejects_non_digit_browser_time() {
        for bad in ["", "-1", "12a", "1.5", " 1"] {
            let error = validate_js_callback(&fields(json!({ "browser-time": bad })))
                .expect_err("must reject");
            assert_eq!(error.field, "browser-time");
        }
    }

    #[test]
    fn rejects_browser_time_outside_i64() {
        let error = validate_js_callback(&fields(json!({
            "browser-time": "99999999999999999999"
        })))
        .expect_err("must reject");
        assert_eq!(error.field, "browser-time");
    }

    #[test]
    fn rejects_was_iframe_outside_enum() {
        let error = validate_js_callback(&fields(json!({ "was_iframe": "TRUE" })))
            .expect_err("must reject");
        assert_eq!(error.field, "was_iframe");
    }

    #[test]
    fn rejects_non_string_values() {
        let error = validate_js_callback(&fields(json!({ "cookies": ["a", "b"] })))
            .expect_err("must reject");
        assert_eq!(error.field, "cookies");

        let error = validate_page_callback(&fields(json!({ "html": 5 })))
            .expect_err("must reject");
        assert_eq!(error.field, "html");
    }

    #[test]
    fn page_callback_defaults_to_empty_strings() {
        let page = validate_page_callback(&RawFields::new()).expect("valid");
        assert_eq!(
            page,
            PageCallback {
                uri: String::new(),
                html: String::new(),
            }
        );
    }

    #[test]
    fn digit_strings_always_validate_to_matching_timestamp() {
        fn property(value: u32, title: String) -> TestResult {
            let callback = validate_js_callback(&fields(json!({
                "browser-time": value.to_string(),
                "title": title,
            })));
            match callback {
                Ok(callback) => TestResult::from_bool(
                    callback.browser_timestamp() == i64::from(value)
                        && callback.title == title
                        && callback.cookies.is_empty(),
                ),
                Err(_) => TestResult::failed(),
            }
        }

        QuickCheck::new()
            .tests(200)
            .quickcheck(property as fn(u32, String) -> TestResult);
    }

    #[test]
    fn any_non_digit_character_is_rejected() {
        fn property(prefix: u16, junk: char) -> TestResult {
            if junk.is_ascii_digit() {
                return TestResult::discard();
            }
            let raw = format!("{prefix}{junk}");
            TestResult::from_bool(
                validate_js_callback(&fields(json!({ "browser-time": raw }))).is_err(),
            )
        }

        QuickCheck::new()
            .tests(200)
            .quickcheck(property as fn(u16, char) -> TestResult);
    }
}
