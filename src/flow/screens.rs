use crate::flow::catalog::{AspectFormat, ImageModel, ModelCatalog};
use crate::flow::intent::{Intent, Mode, TopUpPackage};
use crate::flow::ports::Account;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuButton {
    Action { label: String, intent: Intent },
    Link { label: String, url: String },
}

impl MenuButton {
    pub fn action(label: impl Into<String>, intent: Intent) -> Self {
        MenuButton::Action {
            label: label.into(),
            intent,
        }
    }

    pub fn link(label: impl Into<String>, url: impl Into<String>) -> Self {
        MenuButton::Link {
            label: label.into(),
            url: url.into(),
        }
    }
}

/// Transport-neutral button grid; the Telegram layer turns it into an inline keyboard.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Menu {
    pub rows: Vec<Vec<MenuButton>>,
}

impl Menu {
    fn single_column(buttons: Vec<MenuButton>) -> Self {
        Self {
            rows: buttons.into_iter().map(|button| vec![button]).collect(),
        }
    }

    pub fn intents(&self) -> impl Iterator<Item = &Intent> {
        self.rows.iter().flatten().filter_map(|button| match button {
            MenuButton::Action { intent, .. } => Some(intent),
            MenuButton::Link { .. } => None,
        })
    }
}

pub const PICK_MODEL_TEXT: &str = "🤖 Choose a model:";
pub const PICK_MODE_TEXT: &str = "What would you like to do?";
pub const SEND_PHOTO_TEXT: &str = "📎 Send the photo you want to work with.";
pub const SEND_PROMPT_TEXT: &str = "✍️ Describe the image you want.";
pub const SEND_EDIT_PROMPT_TEXT: &str = "✍️ Describe what to do with the photo.";
pub const EXPECTED_PHOTO_TEXT: &str =
    "I need a photo here. Send an image, or go back to the main menu.";
pub const EXPECTED_TEXT_TEXT: &str = "I need a text prompt here. Describe the image in words.";
pub const INVALID_IMAGE_TEXT: &str =
    "I couldn't read that file as an image. Please send a JPEG, PNG or WebP photo.";
pub const USE_BUTTONS_TEXT: &str = "Please use the buttons below.";
pub const STALE_MENU_TEXT: &str = "That menu is no longer active.";
pub const GENERATING_TEXT: &str = "🎨 Generating your image, this can take a minute...";
pub const BUSY_TEXT: &str = "⏳ Your previous image is still being generated. Please wait.";
pub const GENERATION_FAILED_TEXT: &str =
    "😔 The image could not be generated. Your balance was not charged. Please try again.";
pub const DELIVERY_FAILED_TEXT: &str =
    "😔 The image was generated but could not be sent. Your balance was not charged.";
pub const TOP_UP_TEXT: &str = "💰 Top up your balance:";
pub const TOP_UP_UNAVAILABLE_TEXT: &str =
    "Online payments are not available yet. Please contact support to top up your balance.";
pub const ABOUT_TEXT: &str = "ℹ️ This bot turns your prompts and photos into images using \
several AI models. Every new account gets free credits to try it out; each generation \
is charged only after the image has been delivered to you.";
pub const REMEDIATION_TEXT: &str =
    "📢 To generate images, please subscribe to our channel first, then tap \"I've subscribed\".";

pub fn welcome_text(account: &Account) -> String {
    format!(
        "👋 Hi!\n\nBalance: {} credits\n\nChoose an action:",
        account.balance
    )
}

pub fn main_menu(prompts_channel_url: Option<&str>) -> Menu {
    let mut buttons = vec![
        MenuButton::action("🎨 Generate an image", Intent::OpenGenerate),
        MenuButton::action("💰 Top up balance", Intent::TopUpMenu),
    ];
    if let Some(url) = prompts_channel_url {
        buttons.push(MenuButton::link("📢 Prompt ideas channel", url));
    }
    buttons.push(MenuButton::action("ℹ️ About", Intent::About));
    Menu::single_column(buttons)
}

fn back_to_main() -> MenuButton {
    MenuButton::action("🏠 Main menu", Intent::MainMenu)
}

pub fn model_menu(catalog: &ModelCatalog, selected: &ImageModel) -> Menu {
    let mut buttons = catalog
        .models()
        .iter()
        .map(|model| {
            let marker = if model.key == selected.key { "✅ " } else { "" };
            MenuButton::action(
                format!("{marker}{} · {} credits", model.name, model.price),
                Intent::PickModel(model.key.clone()),
            )
        })
        .collect::<Vec<_>>();
    buttons.push(back_to_main());
    Menu::single_column(buttons)
}

pub fn mode_menu() -> Menu {
    Menu::single_column(vec![
        MenuButton::action("📝 Text to image", Intent::PickMode(Mode::TextOnly)),
        MenuButton::action("🖼 Photo + text", Intent::PickMode(Mode::ImagePlusText)),
        back_to_main(),
    ])
}

pub fn format_menu(selected: AspectFormat) -> Menu {
    let mut buttons = AspectFormat::ALL
        .into_iter()
        .map(|format| {
            let marker = if format == selected { "✅ " } else { "" };
            MenuButton::action(
                format!("{marker}{}", format.label()),
                Intent::PickFormat(format),
            )
        })
        .collect::<Vec<_>>();
    buttons.push(back_to_main());
    Menu::single_column(buttons)
}

pub fn format_prompt_text(model: &ImageModel) -> String {
    format!("📐 Model: {}. Choose a format:", model.name)
}

pub fn cancel_menu() -> Menu {
    Menu::single_column(vec![back_to_main()])
}

pub fn post_generation_menu(has_source_image: bool) -> Menu {
    let photo_label = if has_source_image {
        "🖼 Use another photo"
    } else {
        "🖼 Add a photo"
    };
    Menu::single_column(vec![
        MenuButton::action("🔁 Regenerate", Intent::Regenerate),
        MenuButton::action("✏️ Edit prompt", Intent::EditPrompt),
        MenuButton::action(photo_label, Intent::AddPhoto),
        back_to_main(),
    ])
}

pub fn top_up_menu() -> Menu {
    let mut buttons = TopUpPackage::ALL
        .into_iter()
        .map(|package| MenuButton::action(package.label(), Intent::TopUp(package)))
        .collect::<Vec<_>>();
    buttons.push(back_to_main());
    Menu::single_column(buttons)
}

pub fn top_up_text(account: &Account) -> String {
    format!("{TOP_UP_TEXT}\n\nCurrent balance: {} credits", account.balance)
}

pub fn remediation_menu(url: Option<&str>) -> Menu {
    let mut buttons = Vec::new();
    if let Some(url) = url {
        buttons.push(MenuButton::link("📢 Subscribe", url));
    }
    buttons.push(MenuButton::action(
        "✅ I've subscribed",
        Intent::CheckSubscription,
    ));
    buttons.push(back_to_main());
    Menu::single_column(buttons)
}

pub fn insufficient_funds_text(balance: i64, model: &ImageModel) -> String {
    format!(
        "Not enough credits: {} costs {} credits, your balance is {}. Top up to continue.",
        model.name, model.price, balance
    )
}

pub fn generation_caption(model: &ImageModel) -> String {
    format!("✨ Done with {} · {} credits", model.name, model.price)
}

pub fn balance_text(account: &Account, catalog: &ModelCatalog) -> String {
    let selected = catalog.resolve(account.selected_model.as_deref());
    let mut text = format!(
        "💰 Balance: {} credits\n🤖 Model: {}\n📐 Format: {}\n\nPrices:",
        account.balance,
        selected.name,
        account.selected_format.label()
    );
    for model in catalog.models() {
        text.push_str(&format!("\n• {}: {} credits", model.name, model.price));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_menu_marks_the_selected_model() {
        let catalog = ModelCatalog::builtin();
        let selected = catalog.get("seedream-4").unwrap().clone();
        let menu = model_menu(&catalog, &selected);
        let marked = menu
            .rows
            .iter()
            .flatten()
            .filter(|button| matches!(button, MenuButton::Action { label, .. } if label.starts_with("✅")))
            .count();
        assert_eq!(marked, 1);
        assert_eq!(menu.intents().last(), Some(&Intent::MainMenu));
    }

    #[test]
    fn main_menu_link_is_optional() {
        assert_eq!(main_menu(None).rows.len(), 3);
        let with_link = main_menu(Some("https://t.me/prompts"));
        assert!(with_link
            .rows
            .iter()
            .flatten()
            .any(|button| matches!(button, MenuButton::Link { .. })));
    }
}
