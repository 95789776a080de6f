// ABOUTME: Rewrites upstream host/port settings in pgbouncer.ini [databases] entries
// ABOUTME: Pure text transformation so the swap can be unit-tested without a proxy

/// Result of rewriting a pgbouncer.ini file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRewrite {
    pub contents: String,
    /// Entries whose host was changed
    pub rewritten: Vec<String>,
}

/// Point the selected `[databases]` entries at `host` (and `port`, if given).
///
/// An empty `databases` selection rewrites every entry, including the `*`
/// fallback. Comments, other sections and unrelated settings are preserved
/// byte for byte.
pub fn rewrite_upstream(
    ini: &str,
    host: &str,
    port: Option<u16>,
    databases: &[String],
) -> UpstreamRewrite {
    let mut in_databases = false;
    let mut rewritten = Vec::new();
    let mut out = Vec::new();

    for line in ini.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            in_databases = trimmed[1..trimmed.len() - 1].trim().eq_ignore_ascii_case("databases");
            out.push(line.to_string());
            continue;
        }
        if !in_databases || trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#')
        {
            out.push(line.to_string());
            continue;
        }
        let Some((name, connstr)) = trimmed.split_once('=') else {
            out.push(line.to_string());
            continue;
        };
        let name = name.trim();
        if !databases.is_empty() && !databases.iter().any(|d| d == name) {
            out.push(line.to_string());
            continue;
        }

        out.push(format!(
            "{} = {}",
            name,
            rewrite_connstr(connstr.trim(), host, port)
        ));
        rewritten.push(name.to_string());
    }

    let mut contents = out.join("\n");
    if ini.ends_with('\n') {
        contents.push('\n');
    }
    UpstreamRewrite {
        contents,
        rewritten,
    }
}

fn rewrite_connstr(connstr: &str, host: &str, port: Option<u16>) -> String {
    let mut tokens = tokenize(connstr);
    let mut saw_host = false;
    let mut saw_port = false;

    for token in tokens.iter_mut() {
        match token.split_once('=') {
            Some((key, _)) if key.trim() == "host" => {
                *token = format!("host={}", host);
                saw_host = true;
            }
            Some((key, _)) if key.trim() == "port" => {
                if let Some(port) = port {
                    *token = format!("port={}", port);
                }
                saw_port = true;
            }
            _ => {}
        }
    }

    if !saw_host {
        tokens.insert(0, format!("host={}", host));
    }
    if let (false, Some(port)) = (saw_port, port) {
        tokens.push(format!("port={}", port));
    }
    tokens.join(" ")
}

/// Split a libpq-style "key=value key='quoted value'" string on unquoted whitespace.
fn tokenize(connstr: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = connstr.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '\'' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    const INI: &str = "\
[databases]
; application database
app = host=10.0.0.1 port=5432 dbname=app
reports = host=10.0.0.1 dbname=reports password='a b'
* = host=10.0.0.9

[pgbouncer]
listen_port = 6432
host = should-not-change
";

    #[test]
    fn test_rewrites_selected_entries_only() {
        let result = rewrite_upstream(INI, "10.0.0.2", None, &["app".to_string()]);
        assert_eq!(result.rewritten, vec!["app".to_string()]);
        assert!(result
            .contents
            .contains("app = host=10.0.0.2 port=5432 dbname=app"));
        assert!(result
            .contents
            .contains("reports = host=10.0.0.1 dbname=reports password='a b'"));
        assert!(result.contents.contains("host = should-not-change"));
        assert!(result.contents.ends_with('\n'));
    }

    #[test]
    fn test_empty_selection_rewrites_all_entries_and_port() {
        let result = rewrite_upstream(INI, "db-b.internal", Some(5433), &[]);
        assert_eq!(result.rewritten, vec!["app", "reports", "*"]);
        assert!(result
            .contents
            .contains("reports = host=db-b.internal dbname=reports password='a b' port=5433"));
        assert!(result.contents.contains("* = host=db-b.internal port=5433"));
        assert!(result.contents.contains("; application database"));
    }

    #[test]
    fn test_adds_host_when_missing() {
        let ini = "[databases]\napp = dbname=app\n";
        let result = rewrite_upstream(ini, "db-b", None, &[]);
        assert_eq!(result.contents, "[databases]\napp = host=db-b dbname=app\n");
    }

    #[test]
    fn test_unknown_selection_rewrites_nothing() {
        let result = rewrite_upstream(INI, "db-b", None, &["missing".to_string()]);
        assert!(result.rewritten.is_empty());
        assert_eq!(result.contents, INI);
    }
}
