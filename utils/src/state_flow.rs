use tokio::sync::watch::{self, Receiver, Sender};

/// Observable state cell backed by a [`watch`] channel.
///
/// Writers replace the value, readers either sample it or suspend until it
/// matches a predicate. The sender half lives inside the cell, so waits can
/// never observe a closed channel.
pub struct StateFlow<T> {
  sender: Sender<T>,
  receiver: Receiver<T>
}

impl<T: Clone> StateFlow<T> {
  pub fn new(value: T) -> Self {
    let (sender, receiver) = watch::channel(value);
    Self { sender, receiver }
  }

  pub fn get(&self) -> T {
    self.receiver.borrow().clone()
  }

  pub fn set(&self, value: T) {
    self.sender.send_replace(value);
  }

  /// Mutates the value in place, waking every waiter.
  pub fn update(&self, block: impl FnOnce(&mut T)) {
    self.sender.send_modify(block);
  }

  pub async fn await_change(&self) -> T {
    let mut receiver = self.receiver.clone();
    receiver.borrow_and_update();
    receiver.changed().await.unwrap(); // The sender in [self] cannot be dropped
    self.get()
  }

  pub async fn wait_for(&self, block: impl Fn(&T) -> bool) -> T {
    let mut receiver = self.receiver.clone();
    receiver.borrow_and_update();

    let value = self.get();
    if block(&value) {
      return value;
    }

    loop {
      receiver.changed().await.unwrap(); // The sender in [self] cannot be dropped

      let value = self.get();
      if block(&value) {
        return value;
      }
    }
  }
}
