//! Resource name and credential minting.
//!
//! Cloud resource names are the idempotency keys for every create and
//! delete, so they are minted once per worker and never change. Azure
//! bounds them: 38 characters for a VM name (which doubles as the worker
//! id), 24 for IPs and NICs, 15 for the computer name.

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::Rng;
use uuid::Uuid;

const MAX_VM_NAME: usize = 38;
const MAX_IP_NAME: usize = 24;
const MAX_NIC_NAME: usize = 24;
const MAX_COMPUTER_NAME: usize = 15;

pub const ADMIN_PASSWORD_LEN: usize = 72;

const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SPECIAL: &[u8] = b"!@#$%^&*()-_=+[]";

/// Lowercase alphanumeric identifier from a secure random source.
///
/// Two 128-bit random ids concatenated, downcased, with everything outside
/// `[a-z0-9]` stripped.
pub fn nicer_id() -> String {
    let raw = format!("{}{}", Uuid::new_v4(), Uuid::new_v4());
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// The full set of names one worker needs.
#[derive(Debug, Clone)]
pub struct WorkerNames {
    /// VM resource name, also the worker id
    pub vm_name: String,
    pub ip_name: String,
    pub nic_name: String,
    /// Hostname inside the VM
    pub computer_name: String,
}

/// Mint a fresh, collision-resistant name set.
pub fn mint_worker_names() -> WorkerNames {
    WorkerNames {
        vm_name: clip(&format!("vm-{}-{}", nicer_id(), nicer_id()), MAX_VM_NAME),
        ip_name: clip(&format!("pip-{}", nicer_id()), MAX_IP_NAME),
        nic_name: clip(&format!("nic-{}", nicer_id()), MAX_NIC_NAME),
        computer_name: clip(&nicer_id(), MAX_COMPUTER_NAME),
    }
}

fn clip(value: &str, max: usize) -> String {
    let clipped: String = value.chars().take(max).collect();
    // resource names must not end on a separator
    clipped.trim_end_matches('-').to_string()
}

/// Generate the throwaway VM admin password.
///
/// Azure requires 3 of 4 character classes; we always include all four.
/// The password is handed to the create call and never persisted.
pub fn generate_admin_password() -> String {
    let mut rng = OsRng;
    let all: Vec<u8> = [LOWER, UPPER, DIGITS, SPECIAL].concat();

    let mut bytes = Vec::with_capacity(ADMIN_PASSWORD_LEN);
    for class in [LOWER, UPPER, DIGITS, SPECIAL] {
        bytes.push(class[rng.gen_range(0..class.len())]);
    }
    while bytes.len() < ADMIN_PASSWORD_LEN {
        bytes.push(all[rng.gen_range(0..all.len())]);
    }
    bytes.shuffle(&mut rng);

    bytes.into_iter().map(char::from).collect()
}
