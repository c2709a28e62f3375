//! Tables printed at the end of each command.

use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL};
use keel_deploy::{
    ExecutionPlan, LedgerEntry, RunReport, StepStatus, VerificationOutcome, VerificationStatus,
};

fn table<const N: usize>(header: [&str; N]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn status_cell(status: &StepStatus) -> String {
    match status {
        StepStatus::SkippedAlreadyDeployed => "skipped (already deployed)".to_string(),
        StepStatus::FreshlyDeployed => "deployed".to_string(),
        StepStatus::Failed(reason) => format!("failed: {reason}"),
    }
}

fn verification_cell(outcome: Option<&VerificationOutcome>) -> String {
    match outcome.map(|o| &o.status) {
        None => "-".to_string(),
        Some(VerificationStatus::Verified) => "verified".to_string(),
        Some(VerificationStatus::Failed(err)) => format!("not verified: {err}"),
    }
}

/// One row per attempted step of a run.
pub fn run_table(report: &RunReport) -> Table {
    let mut table = table(["Step", "Status", "Address", "Verification"]);

    for step in &report.steps {
        let verification = report.verifications.iter().find(|v| v.step == step.name);
        table.add_row([
            step.name.clone(),
            status_cell(&step.status),
            step.result
                .as_ref()
                .map(|result| result.address.to_string())
                .unwrap_or_else(|| "-".to_string()),
            verification_cell(verification),
        ]);
    }

    table
}

/// One row per step, numbered in execution order.
pub fn plan_table(plan: &ExecutionPlan) -> Table {
    let mut table = table(["#", "Layer", "Step"]);

    let mut index = 0;
    for (layer, steps) in plan.layers.iter().enumerate() {
        for step in steps {
            index += 1;
            table.add_row([index.to_string(), layer.to_string(), step.clone()]);
        }
    }

    table
}

/// One row per ledger entry.
pub fn ledger_table(entries: &[LedgerEntry]) -> Table {
    let mut table = table(["Step", "Address", "Deployed at", "Last run"]);

    for entry in entries {
        table.add_row([
            entry.step.clone(),
            entry.address.to_string(),
            entry.deployed_at.to_rfc3339(),
            if entry.freshly_deployed {
                "deployed".to_string()
            } else {
                "reused".to_string()
            },
        ]);
    }

    table
}

#[cfg(test)]
mod tests {
    use alloy_core::primitives::Address;
    use keel_deploy::{DeployResult, RunState, StepReport, VerificationError};

    use super::*;

    #[test]
    fn test_run_table_lists_steps_and_verifications() {
        let wallet = Address::repeat_byte(0x11);
        let report = RunReport {
            network: "localhost".into(),
            state: RunState::Failed,
            plan: None,
            steps: vec![
                StepReport {
                    name: "Wallet".to_string(),
                    status: StepStatus::FreshlyDeployed,
                    result: Some(DeployResult::fresh(wallet, vec![])),
                },
                StepReport {
                    name: "WalletFactory".to_string(),
                    status: StepStatus::Failed("out of gas".to_string()),
                    result: None,
                },
            ],
            verifications: vec![VerificationOutcome {
                step: "Wallet".to_string(),
                address: wallet,
                status: VerificationStatus::Failed(VerificationError::AlreadyVerified),
            }],
            error: None,
        };

        let rendered = run_table(&report).to_string();
        assert!(rendered.contains(&wallet.to_string()));
        assert!(rendered.contains("failed: out of gas"));
        assert!(rendered.contains("already verified"));
    }

    #[test]
    fn test_plan_table_numbers_steps() {
        let plan = ExecutionPlan {
            order: vec!["Wallet".to_string(), "WalletFactory".to_string()],
            layers: vec![vec!["Wallet".to_string()], vec!["WalletFactory".to_string()]],
        };

        let rendered = plan_table(&plan).to_string();
        assert!(rendered.contains("WalletFactory"));
    }
}
