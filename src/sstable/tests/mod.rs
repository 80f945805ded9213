mod helpers;
mod tests_build;
