use piprov_command_runner::{CommandRunner, CommandSpec};

use crate::AdapterError;

/// Mixer controls tried in order when picking the volume control.
pub const MIXER_PREFERENCE: &[&str] = &["PCM", "Speaker", "Headphone", "Master", "Digital"];

/// One playback device from `aplay -l`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlsaCard {
    pub index: u32,
    pub id: String,
    pub name: String,
    pub device: u32,
}

impl AlsaCard {
    fn label(&self) -> String {
        format!("{} {}", self.id, self.name).to_ascii_lowercase()
    }

    pub fn is_usb(&self) -> bool {
        self.label().contains("usb")
    }

    pub fn is_hdmi(&self) -> bool {
        self.label().contains("hdmi")
    }

    /// ALSA device string for shairport-sync, stable across card renumbering.
    pub fn hw_device(&self) -> String {
        format!("hw:{}", self.id)
    }
}

/// Parses lines like
/// `card 1: Headphones [bcm2835 Headphones], device 0: bcm2835 Headphones [...]`.
pub fn parse_aplay_list(stdout: &str) -> Vec<AlsaCard> {
    stdout.lines().filter_map(parse_card_line).collect()
}

fn parse_card_line(line: &str) -> Option<AlsaCard> {
    let rest = line.trim().strip_prefix("card ")?;
    let (index, rest) = rest.split_once(':')?;
    let (card_part, device_part) = rest.split_once(", device ")?;

    let card_part = card_part.trim();
    let (id, name) = match card_part.split_once(" [") {
        Some((id, name)) => (id.trim(), name.trim_end_matches(']')),
        None => (card_part, card_part),
    };
    let (device, _) = device_part.split_once(':')?;

    Some(AlsaCard {
        index: index.trim().parse().ok()?,
        id: id.to_string(),
        name: name.to_string(),
        device: device.trim().parse().ok()?,
    })
}

/// Picks the output card: an explicit override (id, name or index), then a
/// USB device, then anything that is not HDMI, then the first card.
pub fn choose_output<'a>(cards: &'a [AlsaCard], preferred: Option<&str>) -> Option<&'a AlsaCard> {
    if let Some(wanted) = preferred.map(str::trim).filter(|w| !w.is_empty()) {
        let wanted = wanted.strip_prefix("hw:").unwrap_or(wanted);
        if let Some(card) = cards.iter().find(|c| {
            c.id.eq_ignore_ascii_case(wanted)
                || c.name.eq_ignore_ascii_case(wanted)
                || c.index.to_string() == wanted
        }) {
            return Some(card);
        }
        tracing::warn!(device = wanted, "requested output not found, auto-detecting");
    }

    cards
        .iter()
        .find(|c| c.is_usb())
        .or_else(|| cards.iter().find(|c| !c.is_hdmi()))
        .or_else(|| cards.first())
}

/// Parses `amixer scontrols` lines like `Simple mixer control 'PCM',0`.
pub fn parse_scontrols(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let start = line.find('\'')? + 1;
            let end = start + line[start..].find('\'')?;
            Some(line[start..end].to_string())
        })
        .collect()
}

pub fn choose_mixer(controls: &[String]) -> Option<&str> {
    MIXER_PREFERENCE
        .iter()
        .find_map(|wanted| controls.iter().find(|c| c.as_str() == *wanted))
        .or_else(|| controls.first())
        .map(String::as_str)
}

pub async fn list_cards(runner: &dyn CommandRunner) -> Result<Vec<AlsaCard>, AdapterError> {
    let output = runner.run(&CommandSpec::new("aplay").arg("-l")).await?;
    Ok(parse_aplay_list(&output.stdout))
}

pub async fn mixer_controls(
    runner: &dyn CommandRunner,
    card: &AlsaCard,
) -> Result<Vec<String>, AdapterError> {
    let spec = CommandSpec::new("amixer").args(["-c", &card.index.to_string(), "scontrols"]);
    let output = runner.run(&spec).await?;
    Ok(parse_scontrols(&output.stdout))
}

pub async fn set_volume(
    runner: &dyn CommandRunner,
    card: &AlsaCard,
    control: &str,
    percent: u8,
) -> Result<(), AdapterError> {
    let spec = CommandSpec::new("amixer").args([
        "-c".to_string(),
        card.index.to_string(),
        "sset".to_string(),
        control.to_string(),
        format!("{}%", percent.min(100)),
    ]);
    runner.run(&spec).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PI_WITH_USB: &str = "\
**** List of PLAYBACK Hardware Devices ****
card 0: Headphones [bcm2835 Headphones], device 0: bcm2835 Headphones [bcm2835 Headphones]
  Subdevices: 8/8
  Subdevice #0: subdevice #0
card 1: vc4hdmi0 [vc4-hdmi-0], device 0: MAI PCM i2s-hifi-0 [MAI PCM i2s-hifi-0]
  Subdevices: 1/1
card 2: Device [USB Audio Device], device 0: USB Audio [USB Audio]
  Subdevices: 1/1
";

    #[test]
    fn test_parse_aplay_list() {
        let cards = parse_aplay_list(PI_WITH_USB);
        assert_eq!(cards.len(), 3);
        assert_eq!(
            cards[0],
            AlsaCard {
                index: 0,
                id: "Headphones".into(),
                name: "bcm2835 Headphones".into(),
                device: 0,
            }
        );
        assert_eq!(cards[1].id, "vc4hdmi0");
        assert_eq!(cards[2].name, "USB Audio Device");
    }

    #[test]
    fn test_choose_output_prefers_usb() {
        let cards = parse_aplay_list(PI_WITH_USB);
        assert_eq!(choose_output(&cards, None).unwrap().id, "Device");
    }

    #[test]
    fn test_choose_output_skips_hdmi() {
        let cards = parse_aplay_list(PI_WITH_USB);
        let without_usb: Vec<AlsaCard> = cards.into_iter().filter(|c| !c.is_usb()).rev().collect();
        assert_eq!(choose_output(&without_usb, None).unwrap().id, "Headphones");
    }

    #[test]
    fn test_choose_output_override() {
        let cards = parse_aplay_list(PI_WITH_USB);
        assert_eq!(choose_output(&cards, Some("hw:Headphones")).unwrap().index, 0);
        assert_eq!(choose_output(&cards, Some("1")).unwrap().id, "vc4hdmi0");
        // Unknown override falls back to auto-detection.
        assert_eq!(choose_output(&cards, Some("nope")).unwrap().id, "Device");
    }

    #[test]
    fn test_choose_output_hdmi_only() {
        let cards = parse_aplay_list(
            "card 1: vc4hdmi0 [vc4-hdmi-0], device 0: MAI PCM i2s-hifi-0 [MAI PCM i2s-hifi-0]\n",
        );
        assert_eq!(choose_output(&cards, None).unwrap().id, "vc4hdmi0");
        assert!(choose_output(&[], None).is_none());
    }

    #[test]
    fn test_choose_mixer() {
        let controls = parse_scontrols(
            "Simple mixer control 'Master',0\nSimple mixer control 'Speaker',0\n",
        );
        assert_eq!(controls, vec!["Master", "Speaker"]);
        assert_eq!(choose_mixer(&controls), Some("Speaker"));
        assert_eq!(choose_mixer(&["Line Out".to_string()]), Some("Line Out"));
        assert_eq!(choose_mixer(&[]), None);
    }
}
