// Shared wildcard matcher for operation-name patterns.
//
// Both the global policy layer and per-identity overrides match through this
// one implementation so the two layers can never diverge. A `*` matches any
// sequence of characters; everything else matches literally, and the whole
// pattern must cover the whole candidate (no substring containment).

/// Returns true if `candidate` fully matches `pattern`.
///
/// `get_*` matches `get_health` but not `aget_health`; `*_query` matches
/// `top_query`; `compare_*_plans` matches `compare_two_plans`. A pattern
/// without wildcards is an exact string comparison.
pub fn matches(pattern: &str, candidate: &str) -> bool {
	if !pattern.contains('*') {
		return pattern == candidate;
	}

	// The pattern contains at least one '*', so split yields >= 2 segments.
	// First segment is anchored at the start, last at the end; interior
	// segments must appear in order in between.
	let segments: Vec<&str> = pattern.split('*').collect();
	let first = segments[0];
	let last = segments[segments.len() - 1];
	let middle = &segments[1..segments.len() - 1];

	let mut rest = match candidate.strip_prefix(first) {
		Some(rest) => rest,
		None => return false,
	};

	for segment in middle {
		if segment.is_empty() {
			continue;
		}
		match rest.find(segment) {
			Some(idx) => rest = &rest[idx + segment.len()..],
			None => return false,
		}
	}

	rest.ends_with(last)
}

/// Returns true if any pattern in the list matches the candidate.
pub fn matches_any<I, S>(patterns: I, candidate: &str) -> bool
where
	I: IntoIterator<Item = S>,
	S: AsRef<str>,
{
	patterns
		.into_iter()
		.any(|p| matches(p.as_ref(), candidate))
}
