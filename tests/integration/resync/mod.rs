mod gather;
mod job;
mod stream;
