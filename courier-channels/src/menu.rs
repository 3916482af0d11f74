//! Plain-text rendering of interactive content for channels whose wire
//! protocol has no native buttons or list pickers. Replies come back as the
//! option number, which the ticket layer already matches on.

use crate::types::{Button, ListSection};

pub(crate) fn render_button_menu(body: &str, buttons: &[Button]) -> String {
    let mut out = String::from(body.trim());
    out.push_str("\n");
    for (index, button) in buttons.iter().enumerate() {
        out.push_str(&format!("\n{}. {}", index + 1, button.label.trim()));
    }
    out
}

pub(crate) fn render_list_menu(body: &str, sections: &[ListSection]) -> String {
    let mut out = String::from(body.trim());
    let mut option = 0usize;
    for section in sections {
        if !section.title.trim().is_empty() {
            out.push_str(&format!("\n\n*{}*", section.title.trim()));
        }
        for row in &section.rows {
            option += 1;
            match row.description.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
                Some(description) => {
                    out.push_str(&format!("\n{option}. {} - {description}", row.title.trim()));
                }
                None => out.push_str(&format!("\n{option}. {}", row.title.trim())),
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{render_button_menu, render_list_menu};
    use crate::types::{Button, ListRow, ListSection};

    #[test]
    fn button_menu_numbers_options_in_order() {
        let rendered = render_button_menu(
            "How can we help?",
            &[
                Button {
                    id: "billing".to_string(),
                    label: "Billing".to_string(),
                },
                Button {
                    id: "support".to_string(),
                    label: "Support".to_string(),
                },
            ],
        );
        assert_eq!(rendered, "How can we help?\n\n1. Billing\n2. Support");
    }

    #[test]
    fn list_menu_numbers_rows_across_sections() {
        let rendered = render_list_menu(
            "Pick a topic",
            &[
                ListSection {
                    title: "Sales".to_string(),
                    rows: vec![ListRow {
                        id: "plans".to_string(),
                        title: "Plans".to_string(),
                        description: Some("Pricing tiers".to_string()),
                    }],
                },
                ListSection {
                    title: "Help".to_string(),
                    rows: vec![ListRow {
                        id: "bug".to_string(),
                        title: "Report a bug".to_string(),
                        description: None,
                    }],
                },
            ],
        );
        assert!(rendered.contains("*Sales*"));
        assert!(rendered.contains("1. Plans - Pricing tiers"));
        assert!(rendered.contains("2. Report a bug"));
    }
}
