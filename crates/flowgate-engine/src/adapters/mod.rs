pub mod external_service;
pub mod local_task;

pub use external_service::ExternalServiceAdapter;
pub use local_task::LocalTaskAdapter;

/// Cap on captured text kept in node outputs.
const MAX_OUTPUT: usize = 30_000;

fn truncate(mut text: String) -> String {
    if text.len() > MAX_OUTPUT {
        let mut cut = MAX_OUTPUT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n... (output truncated)");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "é".repeat(MAX_OUTPUT);
        let out = truncate(long);
        assert!(out.ends_with("(output truncated)"));
        assert!(out.len() <= MAX_OUTPUT + 32);
        assert_eq!(truncate("short".into()), "short");
    }
}
