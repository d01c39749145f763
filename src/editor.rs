use serde::{Deserialize, Serialize};

use crate::geometry::{Corner, Point, Quad, nearest_control_point};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    /// Press grabs the nearest corner, moving drags it.
    #[default]
    Drag,
    /// Each press places the next corner in `A, B, C, D` order.
    ClickToPlace,
}

impl InteractionMode {
    pub const ALL: [InteractionMode; 2] = [InteractionMode::Drag, InteractionMode::ClickToPlace];

    pub fn label(self) -> &'static str {
        match self {
            InteractionMode::Drag => "Drag corners",
            InteractionMode::ClickToPlace => "Click to place",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EditorState {
    Idle,
    Selecting { corner: Corner, at: Point },
    Dragging { corner: Corner, at: Point },
}

/// Single writer of the quad. Every accepted pointer event yields a fresh
/// quad snapshot for the caller to publish.
pub struct PointEditor {
    quad: Quad,
    state: EditorState,
    mode: InteractionMode,
    next_placement: Corner,
}

impl PointEditor {
    pub fn new(quad: Quad, mode: InteractionMode) -> Self {
        Self {
            quad,
            state: EditorState::Idle,
            mode,
            next_placement: Corner::A,
        }
    }

    /// Replaces the quad wholesale, e.g. after a new source is opened.
    pub fn reset(&mut self, quad: Quad) {
        self.quad = quad;
        self.state = EditorState::Idle;
        self.next_placement = Corner::A;
    }

    pub fn quad(&self) -> Quad {
        self.quad
    }

    pub fn state(&self) -> EditorState {
        self.state
    }

    pub fn mode(&self) -> InteractionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: InteractionMode) {
        if self.mode != mode {
            self.mode = mode;
            self.state = EditorState::Idle;
            self.next_placement = Corner::A;
        }
    }

    /// Corner currently held, or the one the next click will place.
    pub fn selected(&self) -> Option<Corner> {
        match (self.mode, self.state) {
            (_, EditorState::Selecting { corner, .. } | EditorState::Dragging { corner, .. }) => {
                Some(corner)
            }
            (InteractionMode::ClickToPlace, EditorState::Idle) => Some(self.next_placement),
            (InteractionMode::Drag, EditorState::Idle) => None,
        }
    }

    pub fn pointer_down(&mut self, at: Point) -> Option<Quad> {
        if !at.is_finite() {
            return None;
        }
        match self.mode {
            InteractionMode::Drag => {
                let corner = nearest_control_point(&self.quad, at);
                self.state = EditorState::Selecting { corner, at };
                None
            }
            InteractionMode::ClickToPlace => {
                let corner = self.next_placement;
                self.next_placement = corner.next();
                self.quad = self.quad.with_corner(corner, at);
                tracing::debug!(corner = corner.label(), x = at.x, y = at.y, "corner placed");
                Some(self.quad)
            }
        }
    }

    pub fn pointer_move(&mut self, at: Point) -> Option<Quad> {
        if !at.is_finite() {
            return None;
        }
        let corner = match self.state {
            EditorState::Idle => return None,
            EditorState::Selecting { corner, .. } | EditorState::Dragging { corner, .. } => corner,
        };
        self.state = EditorState::Dragging { corner, at };
        self.quad = self.quad.with_corner(corner, at);
        Some(self.quad)
    }

    pub fn pointer_up(&mut self) {
        self.state = EditorState::Idle;
    }
}
