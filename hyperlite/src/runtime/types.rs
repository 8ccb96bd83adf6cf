/// Sandbox identifier (ULID, 26 characters, sortable by creation time).
pub type SandboxId = String;

pub fn generate_sandbox_id() -> SandboxId {
    ulid::Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = generate_sandbox_id();
        let b = generate_sandbox_id();
        assert_eq!(a.len(), 26);
        assert_ne!(a, b);
    }
}
