use serde::{Deserialize, Serialize};

/// A task as the rest of the application sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
  pub id: String,
  pub name: String,
  pub complete: bool,
}

/// A task that has not been assigned an id yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
  pub name: String,
  pub complete: bool,
}

impl NewTask {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      complete: false,
    }
  }

  pub fn with_id(self, id: impl Into<String>) -> Task {
    Task {
      id: id.into(),
      name: self.name,
      complete: self.complete,
    }
  }
}
