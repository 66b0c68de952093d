//! The `BlockedPaths` ingress config key: newline-separated entries, each
//! either an exact path or an extension pattern (`*.ext`).

#[derive(Debug, Clone, Default)]
pub struct BlockedPaths {
    exact: Vec<String>,
    extensions: Vec<String>,
}

impl BlockedPaths {
    pub fn parse(spec: &str) -> Self {
        let mut exact = Vec::new();
        let mut extensions = Vec::new();
        for line in spec.lines() {
            let entry = line.trim();
            if entry.is_empty() {
                continue;
            }
            if let Some(ext) = entry.strip_prefix("*.") {
                extensions.push(ext.to_string());
            } else {
                exact.push(entry.to_string());
            }
        }
        Self { exact, extensions }
    }

    /// Whether `path` is blocked, by exact match or by its final extension.
    pub fn blocks(&self, path: &str) -> bool {
        if self.exact.iter().any(|p| p == path) {
            return true;
        }
        let Some(final_segment) = path.rsplit('/').next() else {
            return false;
        };
        let Some((_, ext)) = final_segment.rsplit_once('.') else {
            return false;
        };
        self.extensions.iter().any(|e| e == ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_blocks() {
        let blocked = BlockedPaths::parse("/internal/debug\n/internal/admin");
        assert!(blocked.blocks("/internal/debug"));
        assert!(!blocked.blocks("/internal/debugger"));
    }

    #[test]
    fn extension_match_blocks() {
        let blocked = BlockedPaths::parse("*.env\n*.key");
        assert!(blocked.blocks("/config/secrets.env"));
        assert!(blocked.blocks("/certs/server.key"));
        assert!(!blocked.blocks("/assets/app.js"));
    }

    #[test]
    fn empty_blocklist_blocks_nothing() {
        let blocked = BlockedPaths::parse("");
        assert!(!blocked.blocks("/anything"));
    }
}
