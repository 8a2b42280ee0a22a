// crates/ncp-server/src/discovery/index.rs
// Token inverted index over tool records

use chrono::{DateTime, Utc};
use ncp_types::ToolRecord;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Lowercase a query or document into index tokens.
///
/// Splits on non-alphanumeric boundaries and camelCase humps, so
/// `createIssue`, `create_issue`, and `create-issue` all yield
/// `["create", "issue"]`.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    let mut flush = |current: &mut String, tokens: &mut Vec<String>| {
        if !current.is_empty() {
            tokens.push(current.to_lowercase());
            current.clear();
        }
    };

    let mut prev_lower = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if ch.is_uppercase() && prev_lower {
                flush(&mut current, &mut tokens);
            }
            prev_lower = ch.is_lowercase() || ch.is_numeric();
            current.push(ch);
        } else {
            prev_lower = false;
            flush(&mut current, &mut tokens);
        }
    }
    flush(&mut current, &mut tokens);
    tokens
}

/// One tool plus its precomputed token sets.
#[derive(Debug, Clone)]
pub struct IndexedTool {
    pub record: ToolRecord,
    pub qualified: String,
    /// Tokens from description, tool name, and server name.
    pub tokens: HashSet<String>,
    /// Tokens from the tool name alone, for the name-match bonus.
    pub name_tokens: HashSet<String>,
}

/// Immutable index snapshot. Queries run against one `Arc<Index>`; rebuilds
/// construct a fresh index and swap it in, so readers during a rebuild see
/// the pre-rebuild snapshot.
#[derive(Debug)]
pub struct Index {
    pub tools: Vec<IndexedTool>,
    by_token: BTreeMap<String, Vec<usize>>,
    by_server: HashMap<String, Vec<usize>>,
    pub built_at: DateTime<Utc>,
}

impl Index {
    pub fn empty() -> Self {
        Self {
            tools: Vec::new(),
            by_token: BTreeMap::new(),
            by_server: HashMap::new(),
            built_at: Utc::now(),
        }
    }

    /// Build from the engine's source-of-truth map. Duplicate tool names
    /// across servers stay distinct because `(server, tool)` is the identity.
    pub fn build(tools_by_server: &HashMap<String, Vec<ToolRecord>>) -> Self {
        let mut tools = Vec::new();
        let mut by_token: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut by_server: HashMap<String, Vec<usize>> = HashMap::new();

        let mut server_names: Vec<&String> = tools_by_server.keys().collect();
        server_names.sort();

        for server in server_names {
            for record in &tools_by_server[server] {
                let idx = tools.len();
                let mut tokens: HashSet<String> = tokenize(&record.description).into_iter().collect();
                let name_tokens: HashSet<String> =
                    tokenize(&record.tool_name).into_iter().collect();
                tokens.extend(name_tokens.iter().cloned());
                tokens.extend(tokenize(&record.server_name));

                for token in &tokens {
                    by_token.entry(token.clone()).or_default().push(idx);
                }
                by_server.entry(record.server_name.clone()).or_default().push(idx);
                tools.push(IndexedTool {
                    qualified: record.qualified_name(),
                    tokens,
                    name_tokens,
                    record: record.clone(),
                });
            }
        }

        Self {
            tools,
            by_token,
            by_server,
            built_at: Utc::now(),
        }
    }

    /// Indices of tools matching a query token exactly or by prefix.
    /// The prefix scan is a range over the sorted token map, so lookup cost
    /// is logarithmic in distinct tokens plus the matches themselves.
    pub fn candidates(&self, token: &str) -> HashSet<usize> {
        let mut out = HashSet::new();
        for (_, postings) in self
            .by_token
            .range(token.to_string()..)
            .take_while(|(key, _)| key.starts_with(token))
        {
            out.extend(postings.iter().copied());
        }
        out
    }

    pub fn server_count(&self) -> usize {
        self.by_server.len()
    }

    pub fn servers(&self) -> impl Iterator<Item = &String> {
        self.by_server.keys()
    }

    pub fn tools_of(&self, server: &str) -> Vec<&IndexedTool> {
        self.by_server
            .get(server)
            .map(|indices| indices.iter().map(|&i| &self.tools[i]).collect())
            .unwrap_or_default()
    }
}
