//! Prompt construction for DNS query classification

use std::collections::HashMap;
use std::fmt::Write;

use crate::models::{QueryRecord, WhoisRecord};

/// Prompt for a single first-seen query, with WHOIS context when available.
/// Requests strict JSON so the response can be parsed without scraping.
pub fn build_single_prompt(query: &QueryRecord, whois: Option<&WhoisRecord>) -> String {
    let mut p = String::new();

    p.push_str("You are a cybersecurity expert analyzing DNS queries for potential threats.\n\n");

    p.push_str("## DNS Query Details\n");
    let _ = writeln!(p, "- **Domain**: {}", query.domain);
    let _ = writeln!(p, "- **Client**: {} ({})", query.client_name, query.client_id);
    let _ = writeln!(p, "- **Query Type**: {}", query.query_type);
    if let Some(answer) = &query.answer {
        let _ = writeln!(p, "- **Response**: {answer}");
    }
    if let Some(reason) = &query.reason {
        let _ = writeln!(p, "- **Filtering Reason**: {reason}");
    }
    p.push('\n');

    if let Some(whois) = whois {
        p.push_str("## Domain Information (WHOIS)\n");
        if !whois.registrar.is_empty() {
            let _ = writeln!(p, "- **Registrar**: {}", whois.registrar);
        }
        if !whois.country.is_empty() {
            let _ = writeln!(p, "- **Country**: {}", whois.country);
        }
        if !whois.created_date.is_empty() {
            let _ = writeln!(p, "- **Created**: {}", whois.created_date);
        }
        if !whois.updated_date.is_empty() {
            let _ = writeln!(p, "- **Updated**: {}", whois.updated_date);
        }
        if !whois.expiry_date.is_empty() {
            let _ = writeln!(p, "- **Expires**: {}", whois.expiry_date);
        }
        if !whois.name_servers.is_empty() {
            let _ = writeln!(p, "- **Name Servers**: {}", whois.name_servers.join(", "));
        }
        p.push('\n');
    }

    p.push_str("## Analysis Task\n");
    p.push_str("This domain was identified as a **first-time query** from this client. ");
    p.push_str("Analyze this DNS query for potential security threats considering:\n\n");
    p.push_str("1. **Domain Reputation**: Is this a known malicious domain? Does it exhibit suspicious patterns?\n");
    p.push_str("2. **WHOIS Patterns**: Recent registration? Privacy-protected? Unusual registrar or country?\n");
    p.push_str("3. **Query Context**: Does the query type match expected behavior for this domain?\n");
    p.push_str("4. **Infrastructure**: Are the name servers or hosting infrastructure suspicious?\n\n");

    p.push_str("## Required Response Format\n");
    p.push_str("Respond **only** with valid JSON in the following format (no additional text):\n\n");
    p.push_str("```json\n");
    p.push_str("{\n");
    p.push_str("  \"classification\": \"Safe|Suspicious|Malicious\",\n");
    p.push_str("  \"explanation\": \"Brief explanation of your assessment\",\n");
    p.push_str("  \"risk_score\": 1-10,\n");
    p.push_str("  \"suggested_action\": \"Allow|Investigate|Block\"\n");
    p.push_str("}\n");
    p.push_str("```\n\n");

    p.push_str("### Classification Guidelines\n");
    p.push_str("- **Safe** (1-3): Legitimate domain from reputable organizations\n");
    p.push_str("- **Suspicious** (4-7): Unusual patterns that warrant investigation\n");
    p.push_str("- **Malicious** (8-10): Known threats or clear indicators of malicious activity\n\n");

    p.push_str("### Action Guidelines\n");
    p.push_str("- **Allow**: No action needed, domain appears safe\n");
    p.push_str("- **Investigate**: Flag for manual review, potential risk\n");
    p.push_str("- **Block**: Immediate threat, recommend blocking\n");

    p
}

/// Compact prompt for a whole batch; the response must be a JSON array in
/// input order with a `domain` field per item.
pub fn build_batch_prompt(
    queries: &[QueryRecord],
    whois: &HashMap<String, WhoisRecord>,
) -> String {
    let mut p = String::new();

    p.push_str("Analyze these DNS queries for security threats. Respond with JSON array only.\n\n");

    for (i, query) in queries.iter().enumerate() {
        let _ = write!(p, "{}. {}", i + 1, query.domain);
        if let Some(record) = whois.get(&query.domain) {
            if !record.country.is_empty() {
                let _ = write!(p, " [{}]", record.country);
            }
            if !record.registrar.is_empty() {
                let _ = write!(p, " ({})", record.registrar);
            }
        }
        p.push('\n');
    }

    p.push_str("\nFormat: [{\"domain\":\"x.com\",\"classification\":\"Safe|Suspicious|Malicious\",\"explanation\":\"...\",\"risk_score\":1-10,\"suggested_action\":\"Allow|Investigate|Block\"}]\n");

    p
}
