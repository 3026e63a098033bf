use gpui::{App, Window};
use gpui_component::{Theme, ThemeMode};
use parley_core::ThemePreference;

pub fn theme_mode(preference: ThemePreference) -> ThemeMode {
    match preference {
        ThemePreference::Light => ThemeMode::Light,
        ThemePreference::Dark => ThemeMode::Dark,
    }
}

pub fn apply_theme(preference: ThemePreference, window: Option<&mut Window>, cx: &mut App) {
    Theme::change(theme_mode(preference), window, cx);
}
