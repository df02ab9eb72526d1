//! HTML rendering for the summary and per-suite reports

use std::fmt::Write;

use chrono::{DateTime, Local};

use crate::{HarnessLog, SuiteResults, TestResult};

const STYLE: &str = "body{font-family:sans-serif;margin:2em}\
table{border-collapse:collapse}td,th{border:1px solid #999;padding:4px 8px}\
.pass{background:#cfc}.fail{background:#fcc}";

/// Escape text for inclusion in HTML element content or attributes
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title>\
         <style>{STYLE}</style></head>\n<body>\n<h1>{title}</h1>\n{body}</body></html>\n",
        title = escape_html(title),
    )
}

fn status_cell(pass: bool) -> &'static str {
    if pass {
        "<td class=\"pass\">PASS</td>"
    } else {
        "<td class=\"fail\">FAIL</td>"
    }
}

/// Render the top-level summary report for a run
pub fn render_summary(started: DateTime<Local>, harness: &HarnessLog, suites: &[SuiteResults]) -> String {
    let all_pass = harness.is_clean() && suites.iter().all(SuiteResults::is_pass);
    let mut body = String::new();

    let _ = writeln!(
        body,
        "<p>Run started {}. Overall result: <strong>{}</strong></p>",
        started.format("%Y-%m-%d %H:%M:%S"),
        if all_pass { "PASS" } else { "FAIL" }
    );

    body.push_str("<table>\n<tr><th>Suite</th><th>Result</th><th>Results</th><th>Unexpected</th></tr>\n");
    for suite in suites {
        let name = escape_html(&suite.name);
        let link = if suite.is_pass() {
            name
        } else {
            format!("<a href=\"{0}/report.html\">{0}</a>", name)
        };
        let _ = writeln!(
            body,
            "<tr><td>{}</td>{}<td>{}</td><td>{}</td></tr>",
            link,
            status_cell(suite.is_pass()),
            suite.result_count(),
            suite.unexpected_count()
        );
    }
    body.push_str("</table>\n");

    if !harness.errors.is_empty() {
        body.push_str("<h2>Harness errors</h2>\n<ul>\n");
        for error in &harness.errors {
            let _ = writeln!(body, "<li><pre>{}</pre></li>", escape_html(error));
        }
        body.push_str("</ul>\n");
    }
    if !harness.warnings.is_empty() {
        body.push_str("<h2>Harness warnings</h2>\n<ul>\n");
        for warning in &harness.warnings {
            let _ = writeln!(body, "<li>{}</li>", escape_html(warning));
        }
        body.push_str("</ul>\n");
    }

    page("Certification summary", &body)
}

fn render_test_rows(body: &mut String, test: &TestResult) {
    let name = escape_html(&test.name);
    match test.outcome {
        Some(ref outcome) if outcome.is_unexpected() => {
            let _ = writeln!(
                body,
                "<tr class=\"fail\"><td>{}</td><td></td><td>{}</td><td>{}</td><td>{}</td></tr>",
                name,
                escape_html(&outcome.status),
                escape_html(&outcome.expected),
                escape_html(outcome.message.as_deref().unwrap_or(""))
            );
        }
        Some(_) => {}
        None => {
            let _ = writeln!(
                body,
                "<tr class=\"fail\"><td>{}</td><td></td><td>MISSING</td><td>-</td><td>test did not finish</td></tr>",
                name
            );
        }
    }

    for subtest in test.subtests.iter().filter(|s| s.outcome.is_unexpected()) {
        let _ = writeln!(
            body,
            "<tr class=\"fail\"><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            name,
            escape_html(&subtest.name),
            escape_html(&subtest.outcome.status),
            escape_html(&subtest.outcome.expected),
            escape_html(subtest.outcome.message.as_deref().unwrap_or(""))
        );
    }
}

/// Render the failure-detail report for a suite that did not fully pass
pub fn render_subsuite(results: &SuiteResults) -> String {
    let mut body = String::new();

    if !results.started {
        body.push_str("<p class=\"fail\">The suite never reported a start; it probably failed to launch.</p>\n");
    }
    if results.started && !results.finished {
        body.push_str("<p class=\"fail\">The suite did not report an end; it may have crashed.</p>\n");
    }

    let _ = writeln!(
        body,
        "<p>{} results, {} unexpected.</p>",
        results.result_count(),
        results.unexpected_count()
    );

    body.push_str(
        "<table>\n<tr><th>Test</th><th>Subtest</th><th>Status</th><th>Expected</th><th>Message</th></tr>\n",
    );
    for test in &results.tests {
        render_test_rows(&mut body, test);
    }
    body.push_str("</table>\n");

    if !results.errors.is_empty() {
        body.push_str("<h2>Errors</h2>\n<ul>\n");
        for error in &results.errors {
            let _ = writeln!(body, "<li><pre>{}</pre></li>", escape_html(error));
        }
        body.push_str("</ul>\n");
    }

    page(&format!("{} results", results.name), &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_suite_str;

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }

    #[test]
    fn test_summary_links_failing_suites() {
        let passing = parse_suite_str(
            "good",
            "{\"action\":\"suite_start\"}\n{\"action\":\"test_end\",\"test\":\"t\",\"status\":\"PASS\"}",
        );
        let failing = parse_suite_str(
            "bad",
            "{\"action\":\"suite_start\"}\n{\"action\":\"test_end\",\"test\":\"t\",\"status\":\"FAIL\",\"expected\":\"PASS\"}",
        );
        let html = render_summary(Local::now(), &HarnessLog::default(), &[passing, failing]);

        assert!(html.contains("<a href=\"bad/report.html\">bad</a>"));
        assert!(!html.contains("good/report.html"));
        assert!(html.contains("Overall result: <strong>FAIL</strong>"));
    }

    #[test]
    fn test_subsuite_lists_unexpected_only() {
        let results = parse_suite_str(
            "webapi",
            r#"{"action":"suite_start"}
{"action":"test_status","test":"t","subtest":"ok","status":"PASS"}
{"action":"test_status","test":"t","subtest":"<bad>","status":"FAIL","expected":"PASS","message":"x < y"}
{"action":"test_end","test":"t","status":"OK"}"#,
        );
        let html = render_subsuite(&results);
        assert!(html.contains("&lt;bad&gt;"));
        assert!(html.contains("x &lt; y"));
        assert!(!html.contains("<td>ok</td>"));
        assert!(html.contains("did not report an end"));
    }
}
