use anyhow::{anyhow, Result};

/// Resolve the CLI query entries to an ordered list of FQDNs.
///
/// Each entry is either an http(s):// URL whose body lists one name per
/// line, an @-prefixed local file with one name per line, or a literal
/// name. Ordering is preserved across and within sources.
pub async fn load(entries: &[String]) -> Result<Vec<String>> {
	let mut questions = Vec::new();
	for entry in entries {
		if entry.starts_with("http://") || entry.starts_with("https://") {
			questions.extend(fetch_remote_list(entry).await?);
		} else if let Some(path) = entry.strip_prefix('@') {
			questions.extend(read_question_file(path)?);
		} else {
			questions.push(to_fqdn(entry));
		}
	}
	if questions.is_empty() {
		return Err(anyhow!("no questions to ask"));
	}
	Ok(questions)
}

/// Ensure the trailing dot that marks a fully-qualified name.
pub fn to_fqdn(name: &str) -> String {
	let name = name.trim();
	if name.ends_with('.') {
		name.to_string()
	} else {
		format!("{}.", name)
	}
}

/// Read questions from a file, one per line.
///
/// Blank lines and lines starting with '#' are skipped.
fn read_question_file(path: &str) -> Result<Vec<String>> {
	let content = std::fs::read_to_string(path)
		.map_err(|e| anyhow!("failed to read question file '{}': {}", path, e))?;
	Ok(split_lines(&content))
}

/// Fetch a remote question list. Any non-2xx status is fatal.
async fn fetch_remote_list(url: &str) -> Result<Vec<String>> {
	let response = reqwest::get(url).await
		.map_err(|e| anyhow!("failed to fetch question list '{}': {}", url, e))?;
	let status = response.status();
	if !status.is_success() {
		return Err(anyhow!(
			"question list '{}' returned status {}", url, status,
		));
	}
	let body = response.text().await
		.map_err(|e| anyhow!("failed to read question list '{}': {}", url, e))?;
	Ok(split_lines(&body))
}

fn split_lines(content: &str) -> Vec<String> {
	content.lines()
		.map(str::trim)
		.filter(|line| !line.is_empty() && !line.starts_with('#'))
		.map(to_fqdn)
		.collect()
}
