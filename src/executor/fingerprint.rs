//! Deterministic identity of a JVM invocation: the same options, classpath and version
//! always hash to the same value regardless of the order they were given in.
use sha2::{Digest, Sha256};

pub fn fingerprint_data(
    jvm_options: &[String],
    classpath: &[String],
    jvm_version: &str,
) -> String {
    let mut options: Vec<&str> = jvm_options.iter().map(String::as_str).collect();
    options.sort_unstable();
    let mut entries: Vec<&str> = classpath.iter().map(String::as_str).collect();
    entries.sort_unstable();

    let mut hasher = Sha256::new();
    update_section(&mut hasher, b"options", &options);
    update_section(&mut hasher, b"classpath", &entries);
    update_section(&mut hasher, b"version", &[jvm_version]);
    format!("{:x}", hasher.finalize())
}

/// Tag, item count, then each item length-prefixed.
fn update_section(hasher: &mut Sha256, tag: &[u8], items: &[&str]) {
    hasher.update(tag);
    hasher.update((items.len() as u64).to_be_bytes());
    for item in items {
        hasher.update((item.len() as u64).to_be_bytes());
        hasher.update(item.as_bytes());
    }
}
