use gpui::{Pixels, ScrollHandle, point, px};

/// Distance from the tail that still counts as "at the bottom".
const FOLLOW_THRESHOLD: Pixels = px(24.);
const SCROLL_DELTA_EPSILON: f32 = 1.0;

/// Keeps the thread pinned to its newest message unless the user scrolls away.
pub struct ScrollManager {
    scroll_handle: ScrollHandle,
    pending_scroll_to_bottom: bool,
    follow_bottom: bool,
    last_scroll_offset: Pixels,
    last_max_offset: Pixels,
}

impl ScrollManager {
    pub fn new() -> Self {
        Self {
            scroll_handle: ScrollHandle::new(),
            pending_scroll_to_bottom: false,
            follow_bottom: true,
            last_scroll_offset: Pixels::ZERO,
            last_max_offset: Pixels::ZERO,
        }
    }

    pub fn handle(&self) -> &ScrollHandle {
        &self.scroll_handle
    }

    pub fn request_scroll_to_bottom_if_following(&mut self) {
        if self.follow_bottom || self.was_near_bottom() {
            self.pending_scroll_to_bottom = true;
        }
    }

    /// Jumps to the tail, used when a different conversation is shown.
    pub fn reset(&mut self) {
        self.last_scroll_offset = Pixels::ZERO;
        self.last_max_offset = Pixels::ZERO;
        self.follow_bottom = true;
        self.pending_scroll_to_bottom = true;
    }

    pub fn update_follow_state(&mut self) {
        let offset = self.scroll_handle.offset().y;
        let max_offset = self.scroll_handle.max_offset().height;
        let offset_delta = f32::from(offset) - f32::from(self.last_scroll_offset);
        let content_changed =
            (f32::from(max_offset) - f32::from(self.last_max_offset)).abs() > SCROLL_DELTA_EPSILON;

        if self.pending_scroll_to_bottom || (content_changed && self.was_near_bottom()) {
            self.follow_bottom = true;
        } else if self.follow_bottom {
            if offset_delta > SCROLL_DELTA_EPSILON && !content_changed {
                self.follow_bottom = false;
            }
        } else if offset_delta < -SCROLL_DELTA_EPSILON && self.is_near_bottom() {
            self.follow_bottom = true;
        }

        self.last_scroll_offset = offset;
        self.last_max_offset = max_offset;
    }

    pub fn apply_pending_scroll(&mut self) {
        if self.follow_bottom || self.pending_scroll_to_bottom {
            let max_offset = self.scroll_handle.max_offset().height;
            let current_x = self.scroll_handle.offset().x;
            // Scrolling down moves the offset negative.
            let target_y = if max_offset > Pixels::ZERO {
                -max_offset
            } else {
                Pixels::ZERO
            };
            self.scroll_handle.set_offset(point(current_x, target_y));
        }

        self.pending_scroll_to_bottom = false;
    }

    fn is_near_bottom(&self) -> bool {
        near_bottom(self.scroll_handle.offset().y, self.scroll_handle.max_offset().height)
    }

    fn was_near_bottom(&self) -> bool {
        near_bottom(self.last_scroll_offset, self.last_max_offset)
    }
}

impl Default for ScrollManager {
    fn default() -> Self {
        Self::new()
    }
}

fn near_bottom(offset: Pixels, max_offset: Pixels) -> bool {
    if max_offset <= Pixels::ZERO {
        return true;
    }
    (offset + max_offset).abs() <= FOLLOW_THRESHOLD
}
