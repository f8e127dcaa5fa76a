//! Mouse and keyboard state in the form ShaderToy shaders expect.
//!
//! The keyboard is exposed to shaders as a 256x3 single channel image indexed by
//! JavaScript key code: row 0 holds keys currently down, row 1 keys pressed this
//! frame, row 2 a toggle flipped on every press.

use glam::{Vec2, Vec4};
use winit::event::{ElementState, MouseButton, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

/// Width of the keyboard image.
pub const KEY_COUNT: usize = 256;

/// Value written for a set key. The keyboard image is normalized, so shaders read 1.0.
const KEY_SET: u8 = 255;

/// Maps a physical key to its JavaScript `keyCode`.
pub fn js_key_code(key: KeyCode) -> Option<u8> {
    use KeyCode::*;

    const LETTERS: [KeyCode; 26] = [
        KeyA, KeyB, KeyC, KeyD, KeyE, KeyF, KeyG, KeyH, KeyI, KeyJ, KeyK, KeyL, KeyM, KeyN,
        KeyO, KeyP, KeyQ, KeyR, KeyS, KeyT, KeyU, KeyV, KeyW, KeyX, KeyY, KeyZ,
    ];
    const DIGITS: [KeyCode; 10] = [
        Digit0, Digit1, Digit2, Digit3, Digit4, Digit5, Digit6, Digit7, Digit8, Digit9,
    ];
    const NUMPAD: [KeyCode; 10] = [
        Numpad0, Numpad1, Numpad2, Numpad3, Numpad4, Numpad5, Numpad6, Numpad7, Numpad8, Numpad9,
    ];
    const FUNCTION: [KeyCode; 12] = [F1, F2, F3, F4, F5, F6, F7, F8, F9, F10, F11, F12];

    let offset = |table: &[KeyCode], base: u8| {
        table
            .iter()
            .position(|k| *k == key)
            .map(|i| base + i as u8)
    };
    if let Some(code) = offset(&LETTERS, 65)
        .or_else(|| offset(&DIGITS, 48))
        .or_else(|| offset(&NUMPAD, 96))
        .or_else(|| offset(&FUNCTION, 112))
    {
        return Some(code);
    }

    let code = match key {
        Backspace => 8,
        Tab => 9,
        Enter | NumpadEnter => 13,
        ShiftLeft | ShiftRight => 16,
        ControlLeft | ControlRight => 17,
        AltLeft | AltRight => 18,
        Pause => 19,
        CapsLock => 20,
        Escape => 27,
        Space => 32,
        PageUp => 33,
        PageDown => 34,
        End => 35,
        Home => 36,
        ArrowLeft => 37,
        ArrowUp => 38,
        ArrowRight => 39,
        ArrowDown => 40,
        Insert => 45,
        Delete => 46,
        Semicolon => 186,
        Equal => 187,
        Comma => 188,
        Minus => 189,
        Period => 190,
        Slash => 191,
        Backquote => 192,
        BracketLeft => 219,
        Backslash => 220,
        BracketRight => 221,
        Quote => 222,
        _ => return None,
    };
    Some(code)
}

/// Keyboard rows uploaded to the keyboard channel every frame.
#[derive(Clone)]
pub struct KeyboardState {
    current: [u8; KEY_COUNT],
    keypress: [u8; KEY_COUNT],
    toggle: [u8; KEY_COUNT],
}

impl Default for KeyboardState {
    fn default() -> Self {
        Self {
            current: [0; KEY_COUNT],
            keypress: [0; KEY_COUNT],
            toggle: [0; KEY_COUNT],
        }
    }
}

impl KeyboardState {
    /// Records a key transition. Auto-repeat keeps the key down without counting
    /// as a new press.
    pub fn key_event(&mut self, code: u8, pressed: bool, repeat: bool) {
        let i = code as usize;
        self.current[i] = if pressed { KEY_SET } else { 0 };
        if pressed && !repeat {
            self.keypress[i] = KEY_SET;
            self.toggle[i] = KEY_SET - self.toggle[i];
        }
    }

    /// Clears the keypress row once a frame has consumed it.
    pub fn end_frame(&mut self) {
        self.keypress = [0; KEY_COUNT];
    }

    pub fn is_down(&self, code: u8) -> bool {
        self.current[code as usize] != 0
    }

    /// The three rows as texels of the 256x3 keyboard image.
    pub fn texels(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(KEY_COUNT * 3);
        data.extend_from_slice(&self.current);
        data.extend_from_slice(&self.keypress);
        data.extend_from_slice(&self.toggle);
        data
    }
}

/// `iMouse` tracking.
#[derive(Clone, Debug)]
pub struct MouseState {
    /// Last cursor position, bottom-left origin.
    position: Vec2,
    dragging: bool,
    value: Vec4,
}

impl Default for MouseState {
    fn default() -> Self {
        Self {
            position: Vec2::ZERO,
            dragging: false,
            value: Vec4::new(0.0, 0.0, -1.0, -1.0),
        }
    }
}

impl MouseState {
    /// Cursor moved to window coordinates `(x, y)` of a surface `height` pixels tall.
    pub fn cursor_moved(&mut self, x: f32, y: f32, height: f32) {
        self.position = Vec2::new(x, height - y - 1.0);
        if self.dragging {
            self.value.x = self.position.x;
            self.value.y = self.position.y;
        }
    }

    pub fn button(&mut self, button: MouseButton, pressed: bool) {
        if pressed {
            if button == MouseButton::Left {
                self.value = Vec4::new(
                    self.position.x,
                    self.position.y,
                    self.position.x,
                    self.position.y,
                );
                self.dragging = true;
            }
        } else {
            self.dragging = false;
            self.value.z = -1.0;
            self.value.w = -1.0;
        }
    }

    pub fn uniform(&self) -> [f32; 4] {
        self.value.to_array()
    }
}

/// Mouse and keyboard state fed from window events.
#[derive(Clone, Default)]
pub struct Input {
    pub keyboard: KeyboardState,
    pub mouse: MouseState,
}

impl Input {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a window event. `surface_height` is needed to flip the cursor to a
    /// bottom-left origin.
    pub fn handle_event(&mut self, event: &WindowEvent, surface_height: u32) {
        match event {
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(key) = event.physical_key
                    && let Some(code) = js_key_code(key)
                {
                    self.keyboard.key_event(
                        code,
                        event.state == ElementState::Pressed,
                        event.repeat,
                    );
                }
            }
            WindowEvent::MouseInput { state, button, .. } => {
                self.mouse.button(*button, *state == ElementState::Pressed);
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.mouse.cursor_moved(
                    position.x as f32,
                    position.y as f32,
                    surface_height as f32,
                );
            }
            _ => {}
        }
    }

    /// Back to the state right after startup.
    pub fn reset(&mut self) {
        self.mouse = MouseState::default();
        self.keyboard = KeyboardState::default();
    }
}
