mod tests_rotation;
