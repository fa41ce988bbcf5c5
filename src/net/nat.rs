//! MASQUERADE management for the server's internal subnet.
//!
//! Rules are tagged with an iptables comment so removal is idempotent:
//! `clear()` deletes every POSTROUTING rule carrying the tag, in
//! descending line order, and is safe to run at startup for
//! crash-recovery.

use std::io;
use std::process::Command;

use ipnetwork::Ipv4Network;
use log::{debug, info};
use thiserror::Error;

const IPTABLES: &str = "iptables";
const RULE_COMMENT: &str = "stun";

#[derive(Error, Debug)]
pub enum NatError {
    #[error("Could not run iptables: {0}")]
    Spawn(#[from] io::Error),
    #[error("iptables failed: {0}")]
    Command(String),
}

fn run_iptables(args: &[&str]) -> Result<String, NatError> {
    let output = Command::new(IPTABLES).args(args).output()?;
    if !output.status.success() {
        return Err(NatError::Command(format!(
            "iptables {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Append the tagged MASQUERADE rule for `subnet`.
pub fn masquerade(subnet: Ipv4Network) -> Result<(), NatError> {
    run_iptables(&[
        "-t", "nat", "-A", "POSTROUTING",
        "-s", &subnet.to_string(),
        "-j", "MASQUERADE",
        "-m", "comment", "--comment", RULE_COMMENT,
    ])?;
    info!(target: "nat", "MASQUERADE enabled for {}", subnet);
    Ok(())
}

/// Delete every tagged POSTROUTING rule. Returns how many were removed.
pub fn clear() -> Result<usize, NatError> {
    let listing = run_iptables(&["-t", "nat", "-L", "POSTROUTING", "--line-numbers", "-n"])?;
    let rule_numbers = tagged_rule_numbers(&listing);
    for number in &rule_numbers {
        run_iptables(&["-t", "nat", "-D", "POSTROUTING", &number.to_string()])?;
        debug!(target: "nat", "removed POSTROUTING rule {}", number);
    }
    if !rule_numbers.is_empty() {
        info!(target: "nat", "removed {} stale NAT rule(s)", rule_numbers.len());
    }
    Ok(rule_numbers.len())
}

/// Line numbers of tagged rules, descending so deletion does not shift
/// later numbers.
fn tagged_rule_numbers(listing: &str) -> Vec<u32> {
    let needle = format!("/* {} */", RULE_COMMENT);
    let mut numbers: Vec<u32> = listing
        .lines()
        .filter(|line| line.contains(&needle))
        .filter_map(|line| line.split_whitespace().next()?.parse().ok())
        .collect();
    numbers.sort_unstable_by(|a, b| b.cmp(a));
    numbers
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
Chain POSTROUTING (policy ACCEPT)
num  target     prot opt source               destination
1    MASQUERADE  all  --  10.100.0.0/24        0.0.0.0/0            /* stun */
2    SNAT        all  --  192.168.1.0/24       0.0.0.0/0
3    MASQUERADE  all  --  10.101.0.0/24        0.0.0.0/0            /* stun */
";

    #[test]
    fn tagged_rules_are_listed_descending() {
        assert_eq!(tagged_rule_numbers(LISTING), vec![3, 1]);
    }

    #[test]
    fn untagged_listing_yields_nothing() {
        let listing = "Chain POSTROUTING (policy ACCEPT)\n1 SNAT all -- 10.0.0.0/8 0.0.0.0/0\n";
        assert!(tagged_rule_numbers(listing).is_empty());
    }

    #[test]
    fn header_lines_are_ignored() {
        // "num" and "Chain" do not parse as rule numbers.
        assert!(!tagged_rule_numbers(LISTING).contains(&0));
    }
}
