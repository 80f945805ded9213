mod helpers;
mod tests_delete;
