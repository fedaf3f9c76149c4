use crate::flow::catalog::AspectFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    TextOnly,
    ImagePlusText,
}

impl Mode {
    fn token(self) -> &'static str {
        match self {
            Mode::TextOnly => "text",
            Mode::ImagePlusText => "image",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "text" => Some(Mode::TextOnly),
            "image" => Some(Mode::ImagePlusText),
            _ => None,
        }
    }
}

/// Top-up packages offered on the balance screen. Amounts are in credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopUpPackage {
    Small,
    Medium,
    Large,
}

impl TopUpPackage {
    pub const ALL: [TopUpPackage; 3] = [
        TopUpPackage::Small,
        TopUpPackage::Medium,
        TopUpPackage::Large,
    ];

    pub fn amount(self) -> i64 {
        match self {
            TopUpPackage::Small => 100,
            TopUpPackage::Medium => 500,
            TopUpPackage::Large => 1000,
        }
    }

    pub fn bonus(self) -> i64 {
        match self {
            TopUpPackage::Small => 0,
            TopUpPackage::Medium => 50,
            TopUpPackage::Large => 150,
        }
    }

    pub fn label(self) -> String {
        match self.bonus() {
            0 => format!("{} credits", self.amount()),
            bonus => format!("{} credits +{bonus}", self.amount()),
        }
    }

    fn token(self) -> &'static str {
        match self {
            TopUpPackage::Small => "s",
            TopUpPackage::Medium => "m",
            TopUpPackage::Large => "l",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|package| package.token() == token)
    }
}

/// Everything a menu button can ask for. Callback data is parsed into an intent once,
/// at the transport boundary, and the controller matches on it exhaustively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    MainMenu,
    OpenGenerate,
    PickModel(String),
    PickMode(Mode),
    PickFormat(AspectFormat),
    Regenerate,
    EditPrompt,
    AddPhoto,
    TopUpMenu,
    TopUp(TopUpPackage),
    About,
    CheckSubscription,
}

impl Intent {
    pub fn parse(data: &str) -> Option<Self> {
        let (head, arg) = match data.split_once(':') {
            Some((head, arg)) => (head, Some(arg)),
            None => (data, None),
        };

        match (head, arg) {
            ("main", None) => Some(Intent::MainMenu),
            ("gen", None) => Some(Intent::OpenGenerate),
            ("model", Some(key)) if !key.is_empty() => Some(Intent::PickModel(key.to_string())),
            ("mode", Some(token)) => Mode::from_token(token).map(Intent::PickMode),
            ("fmt", Some(tag)) => AspectFormat::from_tag(tag).map(Intent::PickFormat),
            ("post", Some("regen")) => Some(Intent::Regenerate),
            ("post", Some("edit")) => Some(Intent::EditPrompt),
            ("post", Some("photo")) => Some(Intent::AddPhoto),
            ("topup", None) => Some(Intent::TopUpMenu),
            ("topup", Some(token)) => TopUpPackage::from_token(token).map(Intent::TopUp),
            ("about", None) => Some(Intent::About),
            ("sub", Some("check")) => Some(Intent::CheckSubscription),
            _ => None,
        }
    }

    pub fn callback_data(&self) -> String {
        match self {
            Intent::MainMenu => "main".to_string(),
            Intent::OpenGenerate => "gen".to_string(),
            Intent::PickModel(key) => format!("model:{key}"),
            Intent::PickMode(mode) => format!("mode:{}", mode.token()),
            Intent::PickFormat(format) => format!("fmt:{}", format.tag()),
            Intent::Regenerate => "post:regen".to_string(),
            Intent::EditPrompt => "post:edit".to_string(),
            Intent::AddPhoto => "post:photo".to_string(),
            Intent::TopUpMenu => "topup".to_string(),
            Intent::TopUp(package) => format!("topup:{}", package.token()),
            Intent::About => "about".to_string(),
            Intent::CheckSubscription => "sub:check".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_intent_keeps_colon_in_tag() {
        assert_eq!(
            Intent::parse("fmt:16:9"),
            Some(Intent::PickFormat(AspectFormat::Wide))
        );
        assert_eq!(
            Intent::PickFormat(AspectFormat::Vertical).callback_data(),
            "fmt:9:16"
        );
    }

    #[test]
    fn every_intent_survives_callback_encoding() {
        let intents = vec![
            Intent::MainMenu,
            Intent::OpenGenerate,
            Intent::PickModel("seedream-4.5".to_string()),
            Intent::PickMode(Mode::ImagePlusText),
            Intent::PickFormat(AspectFormat::Original),
            Intent::Regenerate,
            Intent::EditPrompt,
            Intent::AddPhoto,
            Intent::TopUpMenu,
            Intent::TopUp(TopUpPackage::Large),
            Intent::About,
            Intent::CheckSubscription,
        ];
        for intent in intents {
            let data = intent.callback_data();
            assert!(data.len() <= 64, "callback data too long: {data}");
            assert_eq!(Intent::parse(&data), Some(intent));
        }
    }

    #[test]
    fn rejects_legacy_and_malformed_callbacks() {
        assert_eq!(Intent::parse("m1"), None);
        assert_eq!(Intent::parse("model:"), None);
        assert_eq!(Intent::parse("mode:video"), None);
        assert_eq!(Intent::parse("main:extra"), None);
        assert_eq!(Intent::parse(""), None);
    }
}
