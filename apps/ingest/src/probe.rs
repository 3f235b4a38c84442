use std::io;
use std::path::Path;

const BUNDLED_TEMPLATE: &str = include_str!("../assets/probe.js");

const HOST_URL_TOKEN: &str = "[HOST_URL]";
const PAGE_LIST_TOKEN: &str = "[COLLECT_PAGE_LIST_REPLACE_ME]";
const CHAINLOAD_TOKEN: &str = "[CHAINLOAD_REPLACE_ME]";
const PROBE_ID_TOKEN: &str = "[PROBE_ID]";

/// Probe script template with four substitution tokens.
#[derive(Debug, Clone)]
pub struct ProbeTemplate {
    source: String,
}

impl ProbeTemplate {
    pub fn bundled() -> Self {
        Self::from_source(BUNDLED_TEMPLATE)
    }

    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub async fn load(path: Option<&Path>) -> io::Result<Self> {
        match path {
            Some(path) => Ok(Self::from_source(tokio::fs::read_to_string(path).await?)),
            None => Ok(Self::bundled()),
        }
    }

    /// Every host token is replaced; the other tokens only at their first
    /// occurrence. A missing probe id renders as the bare `undefined`.
    pub fn render(
        &self,
        host_url: &str,
        pages_to_collect: &[String],
        chainload_uri: &str,
        probe_id: Option<&str>,
    ) -> String {
        let pages = serde_json::to_string(pages_to_collect).unwrap_or_else(|_| "[]".to_string());
        let chainload =
            serde_json::to_string(chainload_uri).unwrap_or_else(|_| "\"\"".to_string());
        let probe_id = probe_id
            .and_then(|id| serde_json::to_string(id).ok())
            .unwrap_or_else(|| "undefined".to_string());

        self.source
            .replace(HOST_URL_TOKEN, host_url)
            .replacen(PAGE_LIST_TOKEN, &pages, 1)
            .replacen(CHAINLOAD_TOKEN, &chainload, 1)
            .replacen(PROBE_ID_TOKEN, &probe_id, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_all_tokens() {
        let template = ProbeTemplate::from_source(
            "a=[HOST_URL];b=[HOST_URL];p=[COLLECT_PAGE_LIST_REPLACE_ME];\
             c=[CHAINLOAD_REPLACE_ME];i=[PROBE_ID];",
        );
        let rendered = template.render(
            "https://probe.test",
            &["/admin".to_string()],
            "https://cdn.test/x.js",
            Some("k\"1"),
        );
        assert_eq!(
            rendered,
            "a=https://probe.test;b=https://probe.test;p=[\"/admin\"];\
             c=\"https://cdn.test/x.js\";i=\"k\\\"1\";"
        );
    }

    #[test]
    fn defaults_render_as_empty_json_and_undefined() {
        let template = ProbeTemplate::from_source(
            "[COLLECT_PAGE_LIST_REPLACE_ME]|[CHAINLOAD_REPLACE_ME]|[PROBE_ID]|[PROBE_ID]",
        );
        assert_eq!(
            template.render("https://h", &[], "", None),
            "[]|\"\"|undefined|[PROBE_ID]"
        );
    }

    #[test]
    fn bundled_template_carries_every_token() {
        let source = ProbeTemplate::bundled().source;
        for token in [HOST_URL_TOKEN, PAGE_LIST_TOKEN, CHAINLOAD_TOKEN, PROBE_ID_TOKEN] {
            assert!(source.contains(token), "bundled probe is missing {token}");
        }
        let rendered = ProbeTemplate::bundled().render("https://probe.test", &[], "", None);
        assert!(rendered.contains("\"https://probe.test\""));
        assert!(!rendered.contains("[HOST_URL]"));
    }

    #[tokio::test]
    async fn load_prefers_override_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("probe.js");
        std::fs::write(&path, "custom [PROBE_ID]").expect("write template");
        let template = ProbeTemplate::load(Some(&path)).await.expect("load");
        assert_eq!(template.render("https://h", &[], "", Some("x")), "custom \"x\"");
        assert!(ProbeTemplate::load(Some(&dir.path().join("missing.js"))).await.is_err());
    }
}
