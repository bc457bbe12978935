use tasksync::output::{format_human, HumanOutput};

#[test]
fn format_human_includes_sections() {
    let mut human = HumanOutput::new("Task created");
    human.push_summary("ID", "01hx3k");
    human.push_detail("needs a changelog entry");
    human.push_warning("store is 92% full (94208 of 102400 bytes)");
    human.push_next_step("tsk usage");

    let rendered = format_human(&human);
    assert!(rendered.contains("Task created"));
    assert!(rendered.contains("Summary:"));
    assert!(rendered.contains("- ID: 01hx3k"));
    assert!(rendered.contains("Details:"));
    assert!(rendered.contains("- needs a changelog entry"));
    assert!(rendered.contains("Warnings:"));
    assert!(rendered.contains("- store is 92% full"));
    assert!(rendered.contains("Next steps:"));
    assert!(rendered.contains("- tsk usage"));
}

#[test]
fn format_human_omits_empty_sections() {
    let human = HumanOutput::new("No tasks");
    let rendered = format_human(&human);
    assert_eq!(rendered, "No tasks");
}
