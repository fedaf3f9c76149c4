use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use tracing::warn;

use crate::flow::screens::{Menu, MenuButton};

fn to_button(button: &MenuButton) -> Option<InlineKeyboardButton> {
    match button {
        MenuButton::Action { label, intent } => Some(InlineKeyboardButton::callback(
            label.clone(),
            intent.callback_data(),
        )),
        MenuButton::Link { label, url } => match url::Url::parse(url.trim()) {
            Ok(parsed) => Some(InlineKeyboardButton::url(label.clone(), parsed)),
            Err(err) => {
                warn!("Dropping link button with invalid URL '{}': {}", url, err);
                None
            }
        },
    }
}

pub fn menu_to_keyboard(menu: &Menu) -> InlineKeyboardMarkup {
    let rows = menu
        .rows
        .iter()
        .map(|row| row.iter().filter_map(to_button).collect::<Vec<_>>())
        .filter(|row| !row.is_empty())
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}

#[cfg(test)]
mod tests {
    use teloxide::types::InlineKeyboardButtonKind;

    use super::*;
    use crate::flow::catalog::{AspectFormat, ModelCatalog};
    use crate::flow::intent::Intent;
    use crate::flow::screens;

    fn callback_data(markup: &InlineKeyboardMarkup) -> Vec<String> {
        markup
            .inline_keyboard
            .iter()
            .flatten()
            .filter_map(|button| match &button.kind {
                InlineKeyboardButtonKind::CallbackData(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn callback_data_parses_back_into_intents() {
        let catalog = ModelCatalog::builtin();
        let menus = [
            screens::main_menu(Some("https://t.me/prompts")),
            screens::model_menu(&catalog, catalog.default_model()),
            screens::mode_menu(),
            screens::format_menu(AspectFormat::Square),
            screens::post_generation_menu(true),
            screens::top_up_menu(),
            screens::remediation_menu(Some("https://t.me/required")),
        ];
        for menu in &menus {
            let markup = menu_to_keyboard(menu);
            let expected: Vec<Intent> = menu.intents().cloned().collect();
            let parsed: Vec<Intent> = callback_data(&markup)
                .iter()
                .map(|data| {
                    assert!(data.len() <= 64, "callback data too long: {data}");
                    Intent::parse(data).unwrap()
                })
                .collect();
            assert_eq!(parsed, expected);
        }
    }

    #[test]
    fn invalid_links_are_dropped() {
        let markup = menu_to_keyboard(&screens::remediation_menu(Some("not a url")));
        assert!(markup
            .inline_keyboard
            .iter()
            .flatten()
            .all(|button| !matches!(button.kind, InlineKeyboardButtonKind::Url(_))));
        assert_eq!(markup.inline_keyboard.len(), 2);
    }
}
