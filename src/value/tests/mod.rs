mod tests_malformed;
