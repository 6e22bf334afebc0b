#[derive(Debug)]
pub enum CyberdriverError {
  EnigoError(enigo::NewConError),
  InputError(enigo::InputError),
  IoError(std::io::Error),
  ReqwestError(reqwest::Error),
  RuntimeError(String),
  SerdeJsonError(serde_json::Error),
}

impl std::fmt::Display for CyberdriverError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{self:?}")
  }
}

impl std::error::Error for CyberdriverError {}

impl From<enigo::NewConError> for CyberdriverError {
  fn from(err: enigo::NewConError) -> Self {
    Self::EnigoError(err)
  }
}

impl From<enigo::InputError> for CyberdriverError {
  fn from(err: enigo::InputError) -> Self {
    Self::InputError(err)
  }
}

impl From<std::io::Error> for CyberdriverError {
  fn from(err: std::io::Error) -> Self {
    Self::IoError(err)
  }
}

impl From<reqwest::Error> for CyberdriverError {
  fn from(err: reqwest::Error) -> Self {
    Self::ReqwestError(err)
  }
}

impl From<serde_json::Error> for CyberdriverError {
  fn from(err: serde_json::Error) -> Self {
    Self::SerdeJsonError(err)
  }
}

impl From<CyberdriverError> for String {
  fn from(err: CyberdriverError) -> Self {
    format!("{err:?}")
  }
}

pub type Result<T> = std::result::Result<T, CyberdriverError>;
