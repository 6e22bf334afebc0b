#[cfg(windows)]
use windows::Win32::UI::Input::KeyboardAndMouse::{
  GetKeyState, SendInput, INPUT, INPUT_0, INPUT_KEYBOARD, KEYBDINPUT, KEYEVENTF_EXTENDEDKEY,
  KEYEVENTF_KEYUP, KEYEVENTF_SCANCODE, VIRTUAL_KEY, VK_CAPITAL,
};

#[cfg(windows)]
pub fn caps_lock_is_on() -> bool {
  unsafe { (GetKeyState(VK_CAPITAL.0 as i32) & 0x0001) != 0 }
}

#[cfg(windows)]
pub fn send_scancode(scan_code: u16, key_up: bool) {
  let mut flags = KEYEVENTF_SCANCODE;
  let mut sc = scan_code;
  if sc > 0xFF {
    flags |= KEYEVENTF_EXTENDEDKEY;
    sc &= 0xFF;
  }
  if key_up {
    flags |= KEYEVENTF_KEYUP;
  }
  let input = INPUT {
    r#type: INPUT_KEYBOARD,
    Anonymous: INPUT_0 {
      ki: KEYBDINPUT {
        wVk: VIRTUAL_KEY(0),
        wScan: sc,
        dwFlags: flags,
        time: 0,
        dwExtraInfo: 0,
      },
    },
  };
  unsafe {
    let _ = SendInput(&[input], std::mem::size_of::<INPUT>() as i32);
  }
}

#[cfg(not(windows))]
#[allow(dead_code)]
pub fn caps_lock_is_on() -> bool {
  false
}

#[cfg(not(windows))]
pub fn send_scancode(_scan_code: u16, _key_up: bool) {}
