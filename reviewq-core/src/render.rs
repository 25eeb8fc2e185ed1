//! Markdown rendering of review results for posting as a PR comment.

use crate::review::{Analysis, ChangeMetadata, Severity};

/// Render an analysis as the comment body posted on the pull request.
pub fn render_review_comment(analysis: &Analysis, metadata: &ChangeMetadata, version: &str) -> String {
    let mut out = String::new();

    if analysis.has_issues() {
        out.push_str(&format!(
            "🤖 **Code Review Complete** ({} issue{} found)\n\n",
            analysis.issues.len(),
            if analysis.issues.len() == 1 { "" } else { "s" }
        ));
    } else {
        out.push_str("✅ **Code Review Complete**\n\n");
    }

    out.push_str(analysis.summary.trim());
    out.push_str("\n\n");

    for severity in Severity::ALL {
        let issues: Vec<_> = analysis
            .issues
            .iter()
            .filter(|i| i.severity == severity)
            .collect();
        if issues.is_empty() {
            continue;
        }

        out.push_str(&format!("### {} ({})\n\n", heading(severity), issues.len()));
        for issue in issues {
            let location = match issue.line {
                Some(line) => format!("{}:{}", issue.path, line),
                None => issue.path.clone(),
            };
            out.push_str(&format!("- `{}`: {}\n", location, single_line(&issue.message)));
        }
        out.push('\n');
    }

    out.push_str(&format!(
        "**Commit:** `{}`\n**Reviewer version:** `{}`",
        metadata.short_head_sha(),
        version
    ));

    out
}

fn heading(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "Critical",
        Severity::Major => "Major",
        Severity::Minor => "Minor",
        Severity::Nit => "Nits",
    }
}

// List items break if the message spans lines
fn single_line(message: &str) -> String {
    message.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::Issue;

    fn metadata() -> ChangeMetadata {
        ChangeMetadata {
            repo_full_name: "octocat/hello-world".to_string(),
            number: 7,
            title: "t".to_string(),
            author: "octocat".to_string(),
            body: None,
            head_sha: "abc1234def".to_string(),
            base_sha: "0000000".to_string(),
            head_ref: "feature".to_string(),
            base_ref: "main".to_string(),
            html_url: None,
        }
    }

    fn issue(path: &str, line: Option<u32>, severity: Severity, message: &str) -> Issue {
        Issue {
            path: path.to_string(),
            line,
            severity,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_render_with_issues_groups_by_severity() {
        let analysis = Analysis {
            summary: "Found a potential null pointer issue".to_string(),
            issues: vec![
                issue("src/b.rs", None, Severity::Nit, "rename this"),
                issue("src/a.rs", Some(12), Severity::Critical, "null deref"),
            ],
        };
        let comment = render_review_comment(&analysis, &metadata(), "v1");

        assert!(comment.contains("🤖 **Code Review Complete** (2 issues found)"));
        assert!(comment.contains("Found a potential null pointer issue"));
        assert!(comment.contains("- `src/a.rs:12`: null deref"));
        assert!(comment.contains("- `src/b.rs`: rename this"));
        let critical = comment.find("### Critical (1)").unwrap();
        let nits = comment.find("### Nits (1)").unwrap();
        assert!(critical < nits);
        assert!(!comment.contains("### Major"));
        assert!(comment.contains("`abc1234`"));
        assert!(comment.contains("`v1`"));
    }

    #[test]
    fn test_render_without_issues() {
        let analysis = Analysis {
            summary: "All good.".to_string(),
            issues: vec![],
        };
        let comment = render_review_comment(&analysis, &metadata(), "v1");

        assert!(comment.starts_with("✅ **Code Review Complete**"));
        assert!(comment.contains("All good."));
        assert!(!comment.contains("###"));
    }

    #[test]
    fn test_render_singular_issue() {
        let analysis = Analysis {
            summary: "s".to_string(),
            issues: vec![issue("a", Some(1), Severity::Minor, "m")],
        };
        let comment = render_review_comment(&analysis, &metadata(), "v1");
        assert!(comment.contains("(1 issue found)"));
    }

    #[test]
    fn test_multiline_messages_are_flattened() {
        let analysis = Analysis {
            summary: "s".to_string(),
            issues: vec![issue("a", None, Severity::Major, "first\n\nsecond")],
        };
        let comment = render_review_comment(&analysis, &metadata(), "v1");
        assert!(comment.contains("- `a`: first second\n"));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn severity() -> impl Strategy<Value = Severity> {
            prop::sample::select(Severity::ALL.to_vec())
        }

        fn any_issue() -> impl Strategy<Value = Issue> {
            (
                "[a-z]{1,8}\\.rs",
                prop::option::of(1u32..5000),
                severity(),
                "[a-z][a-z \\n]{0,30}",
            )
                .prop_map(|(path, line, severity, message)| Issue {
                    path,
                    line,
                    severity,
                    message,
                })
        }

        proptest! {
            #[test]
            fn every_issue_is_listed_once(
                summary in "[A-Za-z .]{0,40}",
                issues in prop::collection::vec(any_issue(), 0..12),
            ) {
                let analysis = Analysis { summary, issues };
                let comment = render_review_comment(&analysis, &metadata(), "v1");

                let items = comment.lines().filter(|l| l.starts_with("- `")).count();
                prop_assert_eq!(items, analysis.issues.len());
                for severity in Severity::ALL {
                    let count = analysis.count(severity);
                    let heading = format!("### {} ({})", heading(severity), count);
                    prop_assert_eq!(comment.contains(&heading), count > 0);
                }
            }
        }
    }
}
