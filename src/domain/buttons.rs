//! Button State Model
//!
//! Keeps the last-known state of every control on the remote. Notifications
//! only ever address one group (a paddle or the center button), so each
//! update touches the slots of that group and leaves the rest alone.

use std::fmt;

/// Every independently toggle-able control, in slot order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    LeftPlus,
    Left,
    LeftMinus,
    RightPlus,
    Right,
    RightMinus,
    Center,
}

impl Button {
    pub const ALL: [Button; 7] = [
        Button::LeftPlus,
        Button::Left,
        Button::LeftMinus,
        Button::RightPlus,
        Button::Right,
        Button::RightMinus,
        Button::Center,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeftPlus => "LEFT_PLUS",
            Self::Left => "LEFT",
            Self::LeftMinus => "LEFT_MINUS",
            Self::RightPlus => "RIGHT_PLUS",
            Self::Right => "RIGHT",
            Self::RightMinus => "RIGHT_MINUS",
            Self::Center => "CENTER",
        }
    }

    fn slot(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the two paddles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paddle {
    Left,
    Right,
}

impl Paddle {
    /// The (plus, mid, minus) buttons of this paddle.
    fn buttons(&self) -> [Button; 3] {
        match self {
            Self::Left => [Button::LeftPlus, Button::Left, Button::LeftMinus],
            Self::Right => [Button::RightPlus, Button::Right, Button::RightMinus],
        }
    }
}

/// Sub-position flags of a paddle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaddleFlags {
    pub plus: bool,
    pub mid: bool,
    pub minus: bool,
}

impl PaddleFlags {
    pub const RELEASED: PaddleFlags = PaddleFlags {
        plus: false,
        mid: false,
        minus: false,
    };
    pub const PLUS: PaddleFlags = PaddleFlags {
        plus: true,
        mid: false,
        minus: false,
    };
    pub const MID: PaddleFlags = PaddleFlags {
        plus: false,
        mid: true,
        minus: false,
    };
    pub const MINUS: PaddleFlags = PaddleFlags {
        plus: false,
        mid: false,
        minus: true,
    };
}

/// A decoded button notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonFrame {
    Paddle { paddle: Paddle, flags: PaddleFlags },
    Center { pressed: bool },
}

/// Legacy single-code view of the remote, one value per supported combination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ButtonCombo {
    #[default]
    Released = 0x00,
    LeftPlus = 0x01,
    LeftRed = 0x02,
    LeftMinus = 0x03,
    RightPlus = 0x04,
    RightRed = 0x05,
    RightMinus = 0x06,
    LeftPlusRightPlus = 0x07,
    LeftMinusRightMinus = 0x08,
    LeftPlusRightMinus = 0x09,
    LeftMinusRightPlus = 0x0A,
    Center = 0x0B,
}

impl ButtonCombo {
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// Persistent state of the seven button slots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ButtonState {
    slots: [bool; 7],
}

impl ButtonState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the slots addressed by `frame`; all other slots keep their value.
    pub fn apply(&mut self, frame: ButtonFrame) {
        match frame {
            ButtonFrame::Paddle { paddle, flags } => {
                let [plus, mid, minus] = paddle.buttons();
                self.slots[plus.slot()] = flags.plus;
                self.slots[mid.slot()] = flags.mid;
                self.slots[minus.slot()] = flags.minus;
            }
            ButtonFrame::Center { pressed } => {
                self.slots[Button::Center.slot()] = pressed;
            }
        }
    }

    pub fn is_pressed(&self, button: Button) -> bool {
        self.slots[button.slot()]
    }

    /// Active buttons in slot order.
    pub fn snapshot(&self) -> Vec<Button> {
        Button::ALL
            .iter()
            .copied()
            .filter(|b| self.slots[b.slot()])
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| !s)
    }

    pub fn clear(&mut self) {
        self.slots = [false; 7];
    }

    pub fn combo(&self) -> ButtonCombo {
        let left = self.paddle_position(Paddle::Left);
        let right = self.paddle_position(Paddle::Right);
        let center = self.is_pressed(Button::Center);

        match (left, right, center) {
            (None, None, false) => ButtonCombo::Released,
            (Some(Button::LeftPlus), None, false) => ButtonCombo::LeftPlus,
            (Some(Button::Left), None, false) => ButtonCombo::LeftRed,
            (Some(Button::LeftMinus), None, false) => ButtonCombo::LeftMinus,
            (None, Some(Button::RightPlus), false) => ButtonCombo::RightPlus,
            (None, Some(Button::Right), false) => ButtonCombo::RightRed,
            (None, Some(Button::RightMinus), false) => ButtonCombo::RightMinus,
            (Some(Button::LeftPlus), Some(Button::RightPlus), false) => {
                ButtonCombo::LeftPlusRightPlus
            }
            (Some(Button::LeftMinus), Some(Button::RightMinus), false) => {
                ButtonCombo::LeftMinusRightMinus
            }
            (Some(Button::LeftPlus), Some(Button::RightMinus), false) => {
                ButtonCombo::LeftPlusRightMinus
            }
            (Some(Button::LeftMinus), Some(Button::RightPlus), false) => {
                ButtonCombo::LeftMinusRightPlus
            }
            (None, None, true) => ButtonCombo::Center,
            _ => ButtonCombo::Released,
        }
    }

    /// The single active sub-position of a paddle. `None` when released or
    /// when several sub-positions are held at once.
    fn paddle_position(&self, paddle: Paddle) -> Option<Button> {
        let mut active = paddle.buttons().into_iter().filter(|b| self.is_pressed(*b));
        match (active.next(), active.next()) {
            (Some(b), None) => Some(b),
            _ => None,
        }
    }
}
