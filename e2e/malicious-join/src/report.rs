use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Serialize, PartialEq)]
pub struct CaseOutput {
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub all_passed: bool,
    pub test_cases: BTreeMap<String, CaseOutput>,
}

impl Report {
    pub fn new() -> Self {
        Report {
            all_passed: true,
            test_cases: BTreeMap::new(),
        }
    }

    /// Scores one case against whether it was expected to fail.
    pub fn record<E: std::fmt::Display>(&mut self, name: &str, want_err: bool, result: Result<(), E>) {
        let output = match (result, want_err) {
            (Ok(()), true) => CaseOutput {
                passed: false,
                message: "Expected error but got none".to_string(),
            },
            (Err(err), false) => CaseOutput {
                passed: false,
                message: format!("Got unexpected error: {err}"),
            },
            (Err(err), true) => CaseOutput {
                passed: true,
                message: format!("Got expected error: {err}"),
            },
            (Ok(()), false) => CaseOutput {
                passed: true,
                message: "No error, as expected".to_string(),
            },
        };
        self.all_passed &= output.passed;
        self.test_cases.insert(name.to_string(), output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admitted_attacker_fails_the_run() -> anyhow::Result<()> {
        let mut report = Report::new();
        report.record("JoinFromUnattestedNode", true, Err("join rejected: admission denied"));
        report.record::<&str>("JoinClaimingControlPlane", true, Ok(()));
        assert!(!report.all_passed);

        insta::assert_snapshot!(serde_json::to_string_pretty(&report)?, @r#"
        {
          "allPassed": false,
          "testCases": {
            "JoinClaimingControlPlane": {
              "passed": false,
              "message": "Expected error but got none"
            },
            "JoinFromUnattestedNode": {
              "passed": true,
              "message": "Got expected error: join rejected: admission denied"
            }
          }
        }
        "#);
        Ok(())
    }
}
